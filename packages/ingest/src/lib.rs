#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Service-call stream ingestion.
//!
//! [`Ingestion`] wraps a [`ChannelConsumer`], polls it in bounded batches,
//! retries transient read failures with backoff, and decodes every message
//! into a [`ServiceCall`]. Messages that fail decoding are dropped and
//! counted; they never stop the stream.
//!
//! Offsets are not committed by polling. The caller commits a batch with
//! [`Ingestion::commit`] once downstream stages have accepted it, giving
//! at-least-once delivery.

pub mod decode;
pub mod parsing;

use std::time::Duration;

use crime_stream_channel::retry::RetryPolicy;
use crime_stream_channel::{Channel, ChannelConsumer, ChannelError, OffsetTracker};
use crime_stream_channel_models::{MessagePosition, RawMessage, StartPosition};
use crime_stream_event_models::ServiceCall;
use serde::Serialize;

pub use decode::{DecodeError, decode_service_call};

/// Polling limits for an [`Ingestion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    /// Upper bound on messages pulled per poll.
    pub max_records_per_trigger: usize,
    /// How long one poll may wait for data.
    pub poll_timeout: Duration,
    /// Backoff for transient channel failures.
    pub retry: RetryPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_records_per_trigger: 45_000,
            poll_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

/// Running decode counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    /// Messages pulled from the channel.
    pub received: u64,
    /// Messages successfully decoded.
    pub decoded: u64,
    /// Messages dropped because they failed decoding.
    pub decode_errors: u64,
}

/// A decoded service call and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    /// Position of the source message, used for redelivery detection.
    pub position: MessagePosition,
    /// The decoded call.
    pub call: ServiceCall,
}

/// One poll's worth of decoded events.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    /// Successfully decoded events in arrival order.
    pub events: Vec<DecodedEvent>,
    /// Offsets of every message in the batch, decodable or not.
    pub offsets: OffsetTracker,
    /// Number of messages pulled.
    pub received: usize,
    /// Number of messages dropped by decoding.
    pub decode_errors: usize,
}

impl DecodedBatch {
    /// Returns `true` if the poll returned no messages at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.received == 0
    }
}

/// Decodes a polled set of messages, counting failures.
#[must_use]
pub fn decode_batch(messages: &[RawMessage]) -> DecodedBatch {
    let mut batch = DecodedBatch {
        events: Vec::with_capacity(messages.len()),
        received: messages.len(),
        ..DecodedBatch::default()
    };
    batch.offsets.observe(messages);

    for message in messages {
        match decode_service_call(&message.payload) {
            Ok(call) => batch.events.push(DecodedEvent {
                position: message.position,
                call,
            }),
            Err(e) => {
                batch.decode_errors += 1;
                log::debug!(
                    "Dropping undecodable message {}/{}: {e}",
                    message.topic,
                    message.position
                );
            }
        }
    }

    batch
}

/// A subscription to the service-call channel.
pub struct Ingestion {
    consumer: Box<dyn ChannelConsumer>,
    options: IngestOptions,
    stats: DecodeStats,
}

impl Ingestion {
    /// Wraps an existing consumer.
    #[must_use]
    pub fn new(consumer: Box<dyn ChannelConsumer>, options: IngestOptions) -> Self {
        Self {
            consumer,
            options,
            stats: DecodeStats::default(),
        }
    }

    /// Subscribes to `topic` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the subscription cannot be established.
    pub async fn subscribe(
        channel: &Channel,
        topic: &str,
        group: &str,
        start: StartPosition,
        options: IngestOptions,
    ) -> Result<Self, ChannelError> {
        let consumer = channel.subscribe(topic, group, start).await?;
        Ok(Self::new(consumer, options))
    }

    /// Decode counters accumulated so far.
    #[must_use]
    pub const fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Topic being consumed.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.consumer.topic()
    }

    /// Polls and decodes the next batch. An empty batch means the poll
    /// timed out without data.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] for permanent channel failures or once
    /// transient failures exhaust the retry budget.
    pub async fn next_batch(&mut self) -> Result<DecodedBatch, ChannelError> {
        let mut backoff = self.options.retry.backoff();
        let messages = loop {
            match self
                .consumer
                .poll(
                    self.options.max_records_per_trigger,
                    self.options.poll_timeout,
                )
                .await
            {
                Ok(messages) => break messages,
                Err(e) if e.is_transient() => {
                    let Some(delay) = backoff.next_delay() else {
                        log::error!("Polling {} failed permanently: {e}", self.consumer.topic());
                        return Err(backoff.exhausted(e));
                    };
                    log::warn!(
                        "Polling {} failed ({e}), retry {}/{} in {delay:?}...",
                        self.consumer.topic(),
                        backoff.retries(),
                        self.options.retry.max_retries,
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        let batch = decode_batch(&messages);
        self.stats.received += batch.received as u64;
        self.stats.decoded += batch.events.len() as u64;
        self.stats.decode_errors += batch.decode_errors as u64;
        Ok(batch)
    }

    /// Commits `offsets` after downstream stages accepted the messages they
    /// cover.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] for permanent failures or once transient
    /// failures exhaust the retry budget.
    pub async fn commit(&mut self, offsets: &OffsetTracker) -> Result<(), ChannelError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut backoff = self.options.retry.backoff();
        loop {
            match self.consumer.commit(offsets).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(backoff.exhausted(e));
                    };
                    log::warn!("Offset commit failed ({e}), retrying in {delay:?}...");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crime_stream_channel::ChannelProducer;
    use crime_stream_channel::memory::MemoryBroker;

    use super::*;

    fn fast_options(max_records: usize) -> IngestOptions {
        IngestOptions {
            max_records_per_trigger: max_records,
            poll_timeout: Duration::from_millis(10),
            retry: RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        }
    }

    async fn publish(broker: &MemoryBroker, payloads: &[&str]) {
        let producer = broker.producer();
        for payload in payloads {
            producer.send("calls", None, payload.as_bytes()).await.unwrap();
        }
    }

    async fn ingestion(broker: &MemoryBroker, max_records: usize) -> Ingestion {
        let consumer = broker
            .subscribe("calls", "test", StartPosition::Earliest)
            .await;
        Ingestion::new(Box::new(consumer), fast_options(max_records))
    }

    #[tokio::test]
    async fn malformed_message_is_counted_and_skipped() {
        let broker = MemoryBroker::default();
        publish(
            &broker,
            &[
                r#"{"original_crime_type_name": "Theft", "call_date_time": "2018-12-31T10:05:00"}"#,
                r#"{"original_crime_type_name": "Theft"}"#,
                r#"{"original_crime_type_name": "Theft", "call_date_time": "2018-12-31T10:40:00"}"#,
            ],
        )
        .await;

        let mut ingestion = ingestion(&broker, 100).await;
        let batch = ingestion.next_batch().await.unwrap();
        assert_eq!(batch.received, 3);
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.decode_errors, 1);
        assert_eq!(batch.offsets.get("calls", 0), Some(2));
        assert_eq!(
            ingestion.stats(),
            DecodeStats {
                received: 3,
                decoded: 2,
                decode_errors: 1
            }
        );
    }

    #[tokio::test]
    async fn batches_are_capped() {
        let broker = MemoryBroker::default();
        let payload = r#"{"call_date_time": "2018-12-31T10:05:00"}"#;
        publish(&broker, &[payload; 5]).await;

        let mut ingestion = ingestion(&broker, 2).await;
        assert_eq!(ingestion.next_batch().await.unwrap().received, 2);
        assert_eq!(ingestion.next_batch().await.unwrap().received, 2);
        assert_eq!(ingestion.next_batch().await.unwrap().received, 1);
        assert!(ingestion.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let broker = MemoryBroker::default();
        publish(&broker, &[r#"{"call_date_time": "2018-12-31T10:05:00"}"#]).await;
        broker.fail_next_polls(2).await;

        let mut ingestion = ingestion(&broker, 10).await;
        let batch = ingestion.next_batch().await.unwrap();
        assert_eq!(batch.events.len(), 1);
    }

    #[tokio::test]
    async fn persistent_failures_exhaust_retries() {
        let broker = MemoryBroker::default();
        broker.fail_next_polls(10).await;

        let mut ingestion = ingestion(&broker, 10).await;
        let err = ingestion.next_batch().await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::RetriesExhausted { attempts: 4, .. }
        ));
    }

    #[tokio::test]
    async fn commit_advances_group_offset() {
        let broker = MemoryBroker::default();
        publish(&broker, &[r#"{"call_date_time": "2018-12-31T10:05:00"}"#; 3]).await;

        let mut ingestion = ingestion(&broker, 10).await;
        let batch = ingestion.next_batch().await.unwrap();
        ingestion.commit(&batch.offsets).await.unwrap();
        assert_eq!(broker.committed("calls", "test", 0).await, Some(3));
    }
}
