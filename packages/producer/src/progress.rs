//! Progress reporting for the publisher.
//!
//! [`PublishProgress`] receives one event per published record, carrying
//! the channel position it landed at, so a reporter can show both how far
//! the replay is and where in the log it is writing. The CLI plugs in an
//! `indicatif` bar; tests and embedded use take [`null_progress`].

use std::sync::Arc;

use crime_stream_channel_models::MessagePosition;

use crate::PublishReport;

/// Receives events from a publishing run.
pub trait PublishProgress: Send + Sync {
    /// Publishing to `topic` is starting with `total` records.
    fn started(&self, topic: &str, total: u64);

    /// One record was accepted by the channel at `position`.
    fn published(&self, position: MessagePosition);

    /// Every record was published and the producer flushed.
    fn finished(&self, report: &PublishReport);

    /// The run stopped before finishing.
    fn interrupted(&self);
}

/// Discards every event.
pub struct NullProgress;

impl PublishProgress for NullProgress {
    fn started(&self, _topic: &str, _total: u64) {}
    fn published(&self, _position: MessagePosition) {}
    fn finished(&self, _report: &PublishReport) {}
    fn interrupted(&self) {}
}

#[must_use]
pub fn null_progress() -> Arc<dyn PublishProgress> {
    Arc::new(NullProgress)
}
