//! Event-time parsing for service-call timestamps.
//!
//! Dispatch exports write `call_date_time` either as RFC 3339 with an offset
//! or as a naive ISO 8601 local timestamp with optional fractional seconds.
//! Naive timestamps are interpreted as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parses a `call_date_time` value.
#[must_use]
pub fn parse_call_date_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    None
}
