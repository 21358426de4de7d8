#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Durable log-structured channel transports.
//!
//! Producers append opaque payloads to a topic; consumers read them back in
//! per-partition offset order and commit how far they got. Three transports
//! implement the [`ChannelProducer`] / [`ChannelConsumer`] pair:
//!
//! * [`memory`] — in-process log used by tests and embedded pipelines.
//! * [`file`] — append-only log files in a local directory.
//! * `kafka` — an Apache Kafka cluster (requires the `kafka` feature).
//!
//! Delivery is at-least-once: a consumer that restarts from its committed
//! offsets may see messages it already processed.

pub mod file;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod offsets;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crime_stream_channel_models::{
    ChannelAddress, InvalidChannelAddress, MessagePosition, RawMessage, StartPosition,
    TransportKind,
};

pub use offsets::OffsetTracker;

/// Errors raised by channel transports.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// I/O error from a file-backed log.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport is temporarily unreachable.
    #[error("channel unavailable: {message}")]
    Unavailable {
        /// Description of what went wrong.
        message: String,
    },

    /// The channel could not be opened at all (bad directory, client
    /// creation failure, unknown topic).
    #[error("connection failed: {message}")]
    Connection {
        /// Description of what went wrong.
        message: String,
    },

    /// The payload cannot be stored by this transport.
    #[error("payload rejected: {message}")]
    Rejected {
        /// Description of what went wrong.
        message: String,
    },

    /// The channel address could not be parsed.
    #[error(transparent)]
    Address(#[from] InvalidChannelAddress),

    /// The address names a transport that was not compiled in.
    #[error("transport `{0}` is not available in this build")]
    Unsupported(TransportKind),

    /// A transient failure persisted through every retry.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Total number of attempts made.
        attempts: u32,
        /// The last error observed.
        #[source]
        source: Box<Self>,
    },

    /// Error reported by the Kafka client.
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl ChannelError {
    /// Returns `true` if the operation is worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            Self::Unavailable { .. } => true,
            Self::Connection { .. }
            | Self::Rejected { .. }
            | Self::Address(_)
            | Self::Unsupported(_)
            | Self::RetriesExhausted { .. } => false,
            #[cfg(feature = "kafka")]
            Self::Kafka(e) => !matches!(
                e,
                rdkafka::error::KafkaError::ClientCreation(_)
                    | rdkafka::error::KafkaError::ClientConfig(..)
                    | rdkafka::error::KafkaError::Subscription(_)
            ),
        }
    }
}

/// Publishes payloads onto a channel.
#[async_trait]
pub trait ChannelProducer: Send + Sync {
    /// Appends `payload` to `topic`, returning where it was stored.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the transport refuses or fails to store
    /// the message.
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<MessagePosition, ChannelError>;

    /// Waits until every previously sent message is durable.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if outstanding messages could not be
    /// delivered within `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<(), ChannelError>;
}

/// Reads payloads from one topic of a channel.
#[async_trait]
pub trait ChannelConsumer: Send {
    /// Topic this consumer is subscribed to.
    fn topic(&self) -> &str;

    /// Returns up to `max_records` messages in per-partition offset order,
    /// waiting at most `timeout` for the first one to arrive. An empty
    /// result means nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the transport could not be read.
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, ChannelError>;

    /// Records the consumed offsets in `offsets` as processed so that a
    /// restarted consumer using [`StartPosition::Committed`] resumes after
    /// them.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the commit could not be stored.
    async fn commit(&mut self, offsets: &OffsetTracker) -> Result<(), ChannelError>;
}

/// An opened channel that can hand out producers and consumers.
#[derive(Clone)]
pub enum Channel {
    /// In-process log.
    Memory(memory::MemoryBroker),
    /// Directory of append-only log files.
    File(file::FileLog),
    /// Kafka cluster.
    #[cfg(feature = "kafka")]
    Kafka(kafka::KafkaSettings),
}

impl Channel {
    /// Opens the channel named by `address`.
    ///
    /// `client_id` identifies this process to transports that track clients.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the address names a transport that is not
    /// compiled in or the underlying storage cannot be prepared.
    pub async fn open(address: &ChannelAddress, client_id: &str) -> Result<Self, ChannelError> {
        log::info!("Opening channel {address}");
        match address.kind {
            TransportKind::Memory => Ok(Self::Memory(memory::MemoryBroker::default())),
            TransportKind::File => Ok(Self::File(file::FileLog::open(&address.location).await?)),
            #[cfg(feature = "kafka")]
            TransportKind::Kafka => Ok(Self::Kafka(kafka::KafkaSettings::new(
                &address.location,
                client_id,
            ))),
            #[cfg(not(feature = "kafka"))]
            TransportKind::Kafka => {
                let _ = client_id;
                Err(ChannelError::Unsupported(TransportKind::Kafka))
            }
        }
    }

    /// Creates a producer for this channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the transport client cannot be created.
    pub fn producer(&self) -> Result<Arc<dyn ChannelProducer>, ChannelError> {
        match self {
            Self::Memory(broker) => Ok(Arc::new(broker.producer())),
            Self::File(log) => Ok(Arc::new(log.producer())),
            #[cfg(feature = "kafka")]
            Self::Kafka(settings) => Ok(Arc::new(settings.producer()?)),
        }
    }

    /// Subscribes to `topic` as a member of consumer group `group`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the subscription cannot be established.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<Box<dyn ChannelConsumer>, ChannelError> {
        log::info!("Subscribing to {topic} (group={group}, start={start})");
        match self {
            Self::Memory(broker) => Ok(Box::new(broker.subscribe(topic, group, start).await)),
            Self::File(log) => Ok(Box::new(log.subscribe(topic, group, start).await?)),
            #[cfg(feature = "kafka")]
            Self::Kafka(settings) => Ok(Box::new(settings.subscribe(topic, group, start).await?)),
        }
    }
}
