#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Replays a recorded batch of service calls onto a channel.
//!
//! The input is a JSON array of call objects. Every element is re-serialized
//! as compact JSON and published as one message, with a fixed pause between
//! messages so downstream consumers see a steady trickle instead of one
//! burst.

pub mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crime_stream_channel::retry::{RetryPolicy, retry_transient};
use crime_stream_channel::{ChannelError, ChannelProducer};
use crime_stream_channel_models::MessagePosition;
use serde_json::Value;

use crate::progress::PublishProgress;

/// Pause between published records.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(200);

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while publishing.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    /// The input file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The input is not valid JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The input is valid JSON but not an array of records.
    #[error("expected a JSON array of service-call records")]
    NotAnArray,

    /// Publishing to the channel failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// How records are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Destination topic.
    pub topic: String,
    /// Pause after each record.
    pub interval: Duration,
    /// Stop after this many records.
    pub limit: Option<usize>,
    /// Backoff for transient send failures.
    pub retry: RetryPolicy,
}

impl PublishOptions {
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            interval: DEFAULT_PUBLISH_INTERVAL,
            limit: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Summary of a publishing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Records published.
    pub published: u64,
    /// Where the first record landed.
    pub first: Option<MessagePosition>,
    /// Where the last record landed.
    pub last: Option<MessagePosition>,
}

/// Publishes records through a [`ChannelProducer`].
pub struct EventPublisher {
    producer: Arc<dyn ChannelProducer>,
    options: PublishOptions,
}

impl EventPublisher {
    #[must_use]
    pub fn new(producer: Arc<dyn ChannelProducer>, options: PublishOptions) -> Self {
        Self { producer, options }
    }

    #[must_use]
    pub const fn options(&self) -> &PublishOptions {
        &self.options
    }

    /// Reads the records in the JSON array file at `path`.
    ///
    /// # Errors
    ///
    /// * If the file cannot be read
    /// * If the contents are not a JSON array
    pub async fn read_records(path: &Path) -> Result<Vec<Value>, ProducerError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ProducerError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        match serde_json::from_str(&contents)? {
            Value::Array(records) => Ok(records),
            _ => Err(ProducerError::NotAnArray),
        }
    }

    /// Reads `path` and publishes its records.
    ///
    /// # Errors
    ///
    /// * If the file cannot be read or parsed
    /// * If a record cannot be published after retries
    pub async fn publish_file(
        &self,
        path: &Path,
        progress: &Arc<dyn PublishProgress>,
    ) -> Result<PublishReport, ProducerError> {
        let records = Self::read_records(path).await?;
        log::info!("Read {} records from {}", records.len(), path.display());
        self.publish_records(&records, progress).await
    }

    /// Publishes `records` in order, pausing between them.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::Channel`] if a record cannot be published
    /// after retries or the final flush fails.
    pub async fn publish_records(
        &self,
        records: &[Value],
        progress: &Arc<dyn PublishProgress>,
    ) -> Result<PublishReport, ProducerError> {
        let count = self
            .options
            .limit
            .map_or(records.len(), |limit| limit.min(records.len()));
        progress.started(&self.options.topic, count as u64);

        let mut report = PublishReport::default();

        for (i, record) in records.iter().take(count).enumerate() {
            let payload = serde_json::to_vec(record)?;
            let topic = self.options.topic.as_str();
            let producer = &self.producer;
            let payload = payload.as_slice();

            let position = retry_transient(&self.options.retry, "publish", move || {
                producer.send(topic, None, payload)
            })
            .await?;

            report.first.get_or_insert(position);
            report.last = Some(position);
            report.published += 1;
            progress.published(position);
            log::trace!("Published record {i} at {position}");

            if i + 1 < count && !self.options.interval.is_zero() {
                tokio::time::sleep(self.options.interval).await;
            }
        }

        self.producer.flush(FLUSH_TIMEOUT).await?;
        progress.finished(&report);
        log::info!(
            "Published {} records to {}",
            report.published,
            self.options.topic
        );

        Ok(report)
    }
}
