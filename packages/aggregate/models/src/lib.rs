#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Window, aggregate, and emitted-record types.
//!
//! A window is a half-open event-time interval `[start, end)`. Its identity
//! for aggregation purposes is the interval together with a [`GroupKey`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A half-open event-time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Returns `true` if `t` falls inside this window.
    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// The attribute values events are grouped by inside a window.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    /// Category label (`original_crime_type_name`).
    pub category: String,
    /// Disposition code, present only when grouping by disposition.
    pub disposition: Option<String>,
}

impl GroupKey {
    /// A key grouping by category only.
    #[must_use]
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            disposition: None,
        }
    }
}

/// Identity of one aggregation cell: an interval plus a group key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowId {
    /// The event-time interval. Ordered first so that identities sort by
    /// time.
    pub window: TimeWindow,
    /// The grouping attributes.
    pub key: GroupKey,
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.window, self.key.category)?;
        if let Some(disposition) = &self.key.disposition {
            write!(f, "/{disposition:?}")?;
        }
        Ok(())
    }
}

/// How the engine reports windows.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputMode {
    /// Emit each window once, after the watermark passes its end. Emitted
    /// counts are final and never revised.
    #[default]
    Append,
    /// Re-emit every window's current count on every trigger, open windows
    /// included. Rows for open windows are not final and the same window
    /// appears again on later triggers.
    Complete,
}

/// An aggregate leaving the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedRecord {
    /// Which window and key this count belongs to.
    pub id: WindowId,
    /// Number of events counted.
    pub count: u64,
    /// `false` for in-progress snapshots produced in complete mode.
    pub is_final: bool,
}

/// Engine counters, for logging and conservation checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Events counted into a window.
    pub counted: u64,
    /// Events dropped because their window was already finalized.
    pub late: u64,
    /// Redelivered messages skipped by offset de-duplication.
    pub duplicates: u64,
    /// Windows emitted as final.
    pub windows_finalized: u64,
    /// Sum of counts over all final emissions.
    pub finalized_count: u64,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2018, 12, 31, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2018, 12, 31, 11, 0, 0).unwrap();
        let window = TimeWindow { start, end };
        assert!(window.contains(start));
        assert!(!window.contains(end));
        assert_eq!(
            window.to_string(),
            "[2018-12-31 10:00:00, 2018-12-31 11:00:00)"
        );
    }

    #[test]
    fn output_mode_parses_case_insensitively() {
        assert_eq!("append".parse::<OutputMode>().unwrap(), OutputMode::Append);
        assert_eq!(
            "Complete".parse::<OutputMode>().unwrap(),
            OutputMode::Complete
        );
        assert!("update".parse::<OutputMode>().is_err());
        assert_eq!(
            serde_json::to_string(&OutputMode::Complete).unwrap(),
            "\"complete\""
        );
    }

    #[test]
    fn window_ids_sort_by_time_then_key() {
        let t = |h| Utc.with_ymd_and_hms(2018, 12, 31, h, 0, 0).unwrap();
        let early_b = WindowId {
            window: TimeWindow {
                start: t(9),
                end: t(10),
            },
            key: GroupKey::category("B"),
        };
        let late_a = WindowId {
            window: TimeWindow {
                start: t(10),
                end: t(11),
            },
            key: GroupKey::category("A"),
        };
        assert!(early_b < late_a);
    }
}
