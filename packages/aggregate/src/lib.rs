#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Event-time tumbling-window aggregation.
//!
//! The [`engine::AggregationEngine`] counts service calls per
//! `(window, key)`, tracks a monotone [`watermark::Watermark`], and emits a
//! window once the watermark has passed its end. Windows are assigned by
//! [`window::WindowAssigner`]; redelivered messages are filtered by
//! [`dedup::OffsetDeduplicator`].

pub mod dedup;
pub mod engine;
pub mod watermark;
pub mod window;

use crime_stream_aggregate_models::WindowId;

pub use engine::{AggregationEngine, EngineConfig, IngestOutcome};

/// A broken engine invariant. These indicate a logic defect rather than an
/// operational condition and must stop the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    /// A window counter would exceed `u64::MAX`.
    #[error("counter overflow for window {id}")]
    CounterOverflow {
        /// The window whose counter overflowed.
        id: WindowId,
    },

    /// The watermark would move backwards.
    #[error("watermark regressed from {previous} to {proposed}")]
    WatermarkRegressed {
        /// Watermark before the update.
        previous: chrono::DateTime<chrono::Utc>,
        /// The smaller value that was computed.
        proposed: chrono::DateTime<chrono::Utc>,
    },

    /// State exists for a window that was already emitted as final.
    #[error("window {id} finalized twice")]
    WindowRefinalized {
        /// The window that would be emitted again.
        id: WindowId,
    },
}

/// Errors raised by the aggregation engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine was configured with unusable parameters.
    #[error("invalid engine configuration: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },

    /// An engine invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
}
