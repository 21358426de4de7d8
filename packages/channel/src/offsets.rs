//! Per-partition consumption progress.
//!
//! [`OffsetTracker`] records the last offset handed downstream for each
//! topic-partition. Transports commit `offset + 1` (the next offset to read),
//! so a consumer resuming from a commit never re-reads an accepted message.

use std::collections::BTreeMap;

use crime_stream_channel_models::RawMessage;

/// Tracks the last consumed offset per topic-partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetTracker {
    /// Map from (topic, partition) to last-consumed offset.
    offsets: BTreeMap<(String, i32), i64>,
}

impl OffsetTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `offset` as consumed. Offsets never move backwards.
    pub fn update(&mut self, topic: &str, partition: i32, offset: i64) {
        let entry = self
            .offsets
            .entry((topic.to_string(), partition))
            .or_insert(offset);
        *entry = (*entry).max(offset);
    }

    /// Records every message in `messages` as consumed.
    pub fn observe(&mut self, messages: &[RawMessage]) {
        for message in messages {
            self.update(
                &message.topic,
                message.position.partition,
                message.position.offset,
            );
        }
    }

    /// Gets the last consumed offset for a topic-partition.
    #[must_use]
    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.offsets.get(&(topic.to_string(), partition)).copied()
    }

    /// Returns `true` if nothing has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Iterates `(topic, partition, next_offset_to_read)` triples, the form
    /// transports persist on commit.
    pub fn commit_positions(&self) -> impl Iterator<Item = (&str, i32, i64)> {
        self.offsets
            .iter()
            .map(|((topic, partition), offset)| (topic.as_str(), *partition, offset + 1))
    }
}
