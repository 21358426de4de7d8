//! Event-time watermark.
//!
//! The watermark is `max(event time seen) - allowed_lateness`. It is
//! undefined until the first event arrives and never decreases afterwards.

use chrono::{DateTime, TimeDelta, Utc};
use crime_stream_aggregate_models::TimeWindow;

use crate::{EngineError, InvariantViolation};

/// A monotone event-time watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    lateness: TimeDelta,
    max_event_time: Option<DateTime<Utc>>,
    current: Option<DateTime<Utc>>,
}

impl Watermark {
    /// Creates a watermark trailing the newest event by `lateness`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if `lateness` is negative.
    pub fn new(lateness: TimeDelta) -> Result<Self, EngineError> {
        if lateness < TimeDelta::zero() {
            return Err(EngineError::Config {
                message: format!("allowed lateness must not be negative, got {lateness}"),
            });
        }
        Ok(Self {
            lateness,
            max_event_time: None,
            current: None,
        })
    }

    /// Allowed lateness.
    #[must_use]
    pub const fn lateness(&self) -> TimeDelta {
        self.lateness
    }

    /// Current watermark, `None` before the first event.
    #[must_use]
    pub const fn current(&self) -> Option<DateTime<Utc>> {
        self.current
    }

    /// Newest event time observed.
    #[must_use]
    pub const fn max_event_time(&self) -> Option<DateTime<Utc>> {
        self.max_event_time
    }

    /// Returns `true` once the watermark has reached `window.end`.
    #[must_use]
    pub fn has_passed(&self, window: &TimeWindow) -> bool {
        self.current.is_some_and(|wm| wm >= window.end)
    }

    /// Folds `event_time` into the watermark and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::WatermarkRegressed`] if the computed
    /// watermark is below the current one.
    pub fn advance(&mut self, event_time: DateTime<Utc>) -> Result<DateTime<Utc>, InvariantViolation> {
        let max = self
            .max_event_time
            .map_or(event_time, |m| m.max(event_time));
        let proposed = max
            .checked_sub_signed(self.lateness)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        if let Some(previous) = self.current {
            if proposed < previous {
                return Err(InvariantViolation::WatermarkRegressed { previous, proposed });
            }
        }

        self.max_event_time = Some(max);
        self.current = Some(proposed);
        Ok(proposed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 12, 31, h, m, 0).unwrap()
    }

    #[test]
    fn trails_max_event_time_by_lateness() {
        let mut wm = Watermark::new(TimeDelta::minutes(60)).unwrap();
        assert_eq!(wm.current(), None);
        assert_eq!(wm.advance(at(12, 0)).unwrap(), at(11, 0));
        assert_eq!(wm.max_event_time(), Some(at(12, 0)));
    }

    #[test]
    fn never_decreases_for_out_of_order_input() {
        let mut wm = Watermark::new(TimeDelta::minutes(60)).unwrap();
        let times = [
            at(12, 0),
            at(10, 0),
            at(14, 30),
            at(9, 15),
            at(14, 29),
            at(16, 1),
            at(3, 0),
        ];
        let mut previous = None;
        for t in times {
            let current = wm.advance(t).unwrap();
            if let Some(p) = previous {
                assert!(current >= p, "{current} < {p}");
            }
            previous = Some(current);
        }
        assert_eq!(wm.current(), Some(at(15, 1)));
    }

    #[test]
    fn has_passed_is_inclusive_of_window_end() {
        let mut wm = Watermark::new(TimeDelta::minutes(60)).unwrap();
        let window = TimeWindow {
            start: at(10, 0),
            end: at(11, 0),
        };
        assert!(!wm.has_passed(&window));
        wm.advance(at(11, 59)).unwrap();
        assert!(!wm.has_passed(&window));
        wm.advance(at(12, 0)).unwrap();
        assert!(wm.has_passed(&window));
    }

    #[test]
    fn zero_lateness_tracks_max_event_time() {
        let mut wm = Watermark::new(TimeDelta::zero()).unwrap();
        assert_eq!(wm.advance(at(10, 30)).unwrap(), at(10, 30));
    }

    #[test]
    fn rejects_negative_lateness() {
        assert!(Watermark::new(TimeDelta::minutes(-1)).is_err());
    }
}
