//! Kafka transport built on `rdkafka`.
//!
//! Consumers disable auto-commit; offsets are committed only when the
//! ingestion layer calls [`ChannelConsumer::commit`] after downstream
//! acceptance.

use std::time::Duration;

use async_trait::async_trait;
use crime_stream_channel_models::{MessagePosition, RawMessage, StartPosition};
use rdkafka::ClientConfig;
use rdkafka::Message;
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::time::Instant;

use crate::{ChannelConsumer, ChannelError, ChannelProducer, OffsetTracker};

/// How long metadata lookups may take when assigning explicit offsets.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings shared by Kafka producers and consumers.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Comma-separated `host:port` list.
    pub bootstrap_servers: String,
    /// Client identifier reported to the brokers.
    pub client_id: String,
}

impl KafkaSettings {
    /// Creates settings for the given bootstrap servers.
    #[must_use]
    pub fn new(bootstrap_servers: &str, client_id: &str) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.to_string(),
            client_id: client_id.to_string(),
        }
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config
    }

    /// Creates a producer.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connection`] if the client cannot be created.
    pub fn producer(&self) -> Result<KafkaProducer, ChannelError> {
        let producer: FutureProducer =
            self.base_config()
                .create()
                .map_err(|e| ChannelError::Connection {
                    message: format!("failed to create Kafka producer: {e}"),
                })?;
        Ok(KafkaProducer { producer })
    }

    /// Subscribes to `topic` as a member of `group`.
    ///
    /// [`StartPosition::Earliest`] and [`StartPosition::Offset`] assign
    /// every partition explicitly, so offsets already committed by `group`
    /// are ignored. [`StartPosition::Committed`] resumes from them, falling
    /// back to the beginning of the topic.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connection`] if the consumer cannot be
    /// created, subscribed, or assigned.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<KafkaConsumer, ChannelError> {
        let reset = match start {
            StartPosition::Latest => "latest",
            StartPosition::Earliest | StartPosition::Committed | StartPosition::Offset(_) => {
                "earliest"
            }
        };

        let consumer: StreamConsumer = self
            .base_config()
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", reset)
            .create()
            .map_err(|e| ChannelError::Connection {
                message: format!("failed to create Kafka consumer: {e}"),
            })?;

        if let Some(offset) = explicit_offset(start) {
            let metadata = consumer
                .fetch_metadata(Some(topic), METADATA_TIMEOUT)
                .map_err(|e| ChannelError::Connection {
                    message: format!("failed to fetch metadata for {topic}: {e}"),
                })?;
            let partitions: Vec<i32> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic)
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();
            let tpl = assignment(topic, &partitions, offset)?;
            consumer.assign(&tpl).map_err(|e| ChannelError::Connection {
                message: format!("failed to assign offsets: {e}"),
            })?;
            log::debug!(
                "Assigned {} partitions of {topic} at {offset:?}",
                partitions.len()
            );
        } else {
            consumer
                .subscribe(&[topic])
                .map_err(|e| ChannelError::Connection {
                    message: format!("failed to subscribe to {topic}: {e}"),
                })?;
        }

        Ok(KafkaConsumer {
            consumer,
            topic: topic.to_string(),
        })
    }
}

/// Offset every partition is assigned at, or `None` when the group's
/// subscription decides.
const fn explicit_offset(start: StartPosition) -> Option<Offset> {
    match start {
        StartPosition::Earliest => Some(Offset::Beginning),
        StartPosition::Offset(n) => Some(Offset::Offset(n)),
        StartPosition::Latest | StartPosition::Committed => None,
    }
}

fn assignment(
    topic: &str,
    partitions: &[i32],
    offset: Offset,
) -> Result<TopicPartitionList, ChannelError> {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition_offset(topic, *partition, offset)?;
    }
    Ok(tpl)
}

/// Kafka producer.
pub struct KafkaProducer {
    producer: FutureProducer,
}

#[async_trait]
impl ChannelProducer for KafkaProducer {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<MessagePosition, ChannelError> {
        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic).payload(payload);
        if let Some(k) = key {
            record = record.key(k);
        }
        let (partition, offset) = self
            .producer
            .send(record, Duration::from_secs(0))
            .await
            .map_err(|(e, _)| ChannelError::Kafka(e))?;
        Ok(MessagePosition { partition, offset })
    }

    async fn flush(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.producer.flush(timeout)?;
        Ok(())
    }
}

/// Kafka consumer with manual commits.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

#[async_trait]
impl ChannelConsumer for KafkaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(max_records.min(1024));

        while out.len() < max_records {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(Ok(msg)) => out.push(RawMessage {
                    topic: msg.topic().to_string(),
                    position: MessagePosition {
                        partition: msg.partition(),
                        offset: msg.offset(),
                    },
                    payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                }),
                Ok(Err(e)) => {
                    if out.is_empty() {
                        return Err(ChannelError::Kafka(e));
                    }
                    log::warn!("Kafka consumer error after {} messages: {e}", out.len());
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(out)
    }

    async fn commit(&mut self, offsets: &OffsetTracker) -> Result<(), ChannelError> {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition, next) in offsets.commit_positions() {
            tpl.add_partition_offset(topic, partition, Offset::Offset(next))?;
        }
        if tpl.count() == 0 {
            return Ok(());
        }
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }
}
