//! Redelivery filtering keyed on message offsets.
//!
//! Channels deliver at least once, and a partition always redelivers in
//! offset order. Remembering the highest offset applied per partition is
//! therefore enough to recognise a redelivered message.

use std::collections::BTreeMap;

use crime_stream_channel_models::MessagePosition;

/// Remembers the highest applied offset for every partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetDeduplicator {
    applied: BTreeMap<i32, i64>,
}

impl OffsetDeduplicator {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `position` and returns `true` if it has not been applied
    /// before.
    pub fn first_delivery(&mut self, position: MessagePosition) -> bool {
        match self.applied.get_mut(&position.partition) {
            Some(applied) if position.offset <= *applied => false,
            Some(applied) => {
                *applied = position.offset;
                true
            }
            None => {
                self.applied.insert(position.partition, position.offset);
                true
            }
        }
    }
}
