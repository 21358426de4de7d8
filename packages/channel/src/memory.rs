//! In-process log transport.
//!
//! [`MemoryBroker`] keeps every topic as a fixed set of partitions, each a
//! `Vec` of payloads whose index is the message offset. Consumer-group
//! commits are kept alongside, so a consumer re-subscribed with
//! [`StartPosition::Committed`] behaves like a restarted Kafka consumer.
//!
//! The broker can be told to fail upcoming polls, which lets tests drive the
//! transient-error paths of the ingestion layer.

use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crime_stream_channel_models::{MessagePosition, RawMessage, StartPosition};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::{ChannelConsumer, ChannelError, ChannelProducer, OffsetTracker};

/// Number of partitions created for a topic on first use.
pub const DEFAULT_PARTITIONS: i32 = 1;

#[derive(Debug, Default)]
struct BrokerState {
    topics: BTreeMap<String, Vec<Vec<Vec<u8>>>>,
    committed: HashMap<(String, String, i32), i64>,
    partitions_per_topic: i32,
    round_robin: u64,
    failing_polls: u32,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str) -> &mut Vec<Vec<Vec<u8>>> {
        let count = usize::try_from(self.partitions_per_topic.max(1)).unwrap_or(1);
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count])
    }
}

/// Shared handle to an in-process log.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    appended: Arc<Notify>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }
}

impl MemoryBroker {
    /// Creates a broker whose topics have `partitions` partitions each.
    #[must_use]
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                partitions_per_topic: partitions.max(1),
                ..BrokerState::default()
            })),
            appended: Arc::new(Notify::new()),
        }
    }

    /// Creates a producer that appends to this broker.
    #[must_use]
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
        }
    }

    /// Subscribes to `topic` as a member of `group`.
    pub async fn subscribe(&self, topic: &str, group: &str, start: StartPosition) -> MemoryConsumer {
        let mut state = self.state.lock().await;
        let lengths: Vec<i64> = state
            .partitions_mut(topic)
            .iter()
            .map(|p| i64::try_from(p.len()).unwrap_or(i64::MAX))
            .collect();

        let mut next = BTreeMap::new();
        for (partition, len) in (0i32..).zip(lengths) {
            let offset = match start {
                StartPosition::Earliest => 0,
                StartPosition::Latest => len,
                StartPosition::Committed => state
                    .committed
                    .get(&(group.to_string(), topic.to_string(), partition))
                    .copied()
                    .unwrap_or(0),
                StartPosition::Offset(n) => n,
            };
            next.insert(partition, offset);
        }
        drop(state);

        MemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            next,
        }
    }

    /// Makes the next `count` polls against this broker fail with a
    /// transient error.
    pub async fn fail_next_polls(&self, count: u32) {
        self.state.lock().await.failing_polls = count;
    }

    /// Number of messages stored in `topic` across all partitions.
    pub async fn len(&self, topic: &str) -> usize {
        self.state
            .lock()
            .await
            .topics
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum())
    }

    /// Returns `true` if `topic` holds no messages.
    pub async fn is_empty(&self, topic: &str) -> bool {
        self.len(topic).await == 0
    }

    /// Committed next-to-read offset of `group` on one partition.
    pub async fn committed(&self, topic: &str, group: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .await
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }
}

/// Producer half of a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl ChannelProducer for MemoryProducer {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<MessagePosition, ChannelError> {
        let mut state = self.broker.state.lock().await;
        let partition_count = u64::try_from(state.partitions_per_topic.max(1)).unwrap_or(1);
        let slot = key.map_or_else(
            || {
                state.round_robin = state.round_robin.wrapping_add(1);
                state.round_robin
            },
            |k| {
                let mut hasher = DefaultHasher::new();
                k.hash(&mut hasher);
                hasher.finish()
            },
        ) % partition_count;
        let partition = i32::try_from(slot).unwrap_or(0);

        let log = &mut state.partitions_mut(topic)[usize::try_from(partition).unwrap_or(0)];
        let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
        log.push(payload.to_vec());
        drop(state);

        self.broker.appended.notify_waiters();
        Ok(MessagePosition { partition, offset })
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Consumer half of a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConsumer {
    broker: MemoryBroker,
    topic: String,
    group: String,
    /// Next offset to read per partition.
    next: BTreeMap<i32, i64>,
}

impl MemoryConsumer {
    async fn take_available(&mut self, max_records: usize) -> Result<Vec<RawMessage>, ChannelError> {
        let mut state = self.broker.state.lock().await;
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(ChannelError::Unavailable {
                message: "injected broker failure".to_string(),
            });
        }

        let mut out = Vec::new();
        let partitions = state.partitions_mut(&self.topic);
        for (partition, next) in &mut self.next {
            let Some(log) = usize::try_from(*partition)
                .ok()
                .and_then(|p| partitions.get(p))
            else {
                continue;
            };
            while out.len() < max_records {
                let Some(payload) = usize::try_from(*next).ok().and_then(|i| log.get(i)) else {
                    break;
                };
                out.push(RawMessage {
                    topic: self.topic.clone(),
                    position: MessagePosition {
                        partition: *partition,
                        offset: *next,
                    },
                    payload: payload.clone(),
                });
                *next += 1;
            }
        }
        drop(state);
        Ok(out)
    }
}

#[async_trait]
impl ChannelConsumer for MemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let appended = Arc::clone(&self.broker.appended);

        loop {
            let mut notified = pin!(appended.notified());
            notified.as_mut().enable();

            let messages = self.take_available(max_records).await?;
            if !messages.is_empty() || Instant::now() >= deadline {
                return Ok(messages);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, offsets: &OffsetTracker) -> Result<(), ChannelError> {
        let mut state = self.broker.state.lock().await;
        for (topic, partition, next) in offsets.commit_positions() {
            let entry = state
                .committed
                .entry((self.group.clone(), topic.to_string(), partition))
                .or_insert(next);
            *entry = (*entry).max(next);
        }
        drop(state);
        Ok(())
    }
}
