//! Tumbling window assignment.

use chrono::{DateTime, TimeDelta, Utc};
use crime_stream_aggregate_models::{GroupKey, TimeWindow, WindowId};

use crate::EngineError;

/// Maps event times onto epoch-aligned tumbling windows of a fixed size.
///
/// Assignment is a pure function of the event time and the size: the same
/// event time always lands in the same window regardless of arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    size: TimeDelta,
    size_ms: i64,
}

impl WindowAssigner {
    /// Creates an assigner for windows of `size`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] unless `size` is at least one
    /// millisecond.
    pub fn new(size: TimeDelta) -> Result<Self, EngineError> {
        let size_ms = size.num_milliseconds();
        if size_ms <= 0 {
            return Err(EngineError::Config {
                message: format!("window size must be positive, got {size}"),
            });
        }
        Ok(Self { size, size_ms })
    }

    /// Window length.
    #[must_use]
    pub const fn size(&self) -> TimeDelta {
        self.size
    }

    /// The interval containing `event_time`:
    /// `start = floor(event_time / size) * size`.
    #[must_use]
    pub fn interval(&self, event_time: DateTime<Utc>) -> TimeWindow {
        let ms = event_time.timestamp_millis();
        let start_ms = ms.div_euclid(self.size_ms) * self.size_ms;
        let start = DateTime::from_timestamp_millis(start_ms).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = start
            .checked_add_signed(self.size)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        TimeWindow { start, end }
    }

    /// Full window identity for an event at `event_time` grouped by `key`.
    #[must_use]
    pub fn assign(&self, event_time: DateTime<Utc>, key: GroupKey) -> WindowId {
        WindowId {
            window: self.interval(event_time),
            key,
        }
    }
}
