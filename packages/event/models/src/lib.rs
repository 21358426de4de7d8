#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Police service-call event schema.
//!
//! Every message on the service-call channel is a JSON object matching
//! [`RawServiceCall`]. Decoding promotes it to a [`ServiceCall`], which is
//! guaranteed to carry a parsed event time and is never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default topic that service calls are published to.
pub const SERVICE_CALL_TOPIC: &str = "department.police.service.call";

/// A service-call record exactly as it appears on the wire.
///
/// Every field is optional at this level. `call_date_time` is kept as the
/// raw string so that the decoder can decide how to parse it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawServiceCall {
    pub crime_id: Option<String>,
    pub original_crime_type_name: Option<String>,
    pub report_date: Option<String>,
    pub call_date: Option<String>,
    pub offense_date: Option<String>,
    pub call_time: Option<String>,
    pub call_date_time: Option<String>,
    pub disposition: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub agency_id: Option<String>,
    pub address_type: Option<String>,
    pub common_location: Option<String>,
}

/// A decoded service call with a guaranteed event time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCall {
    /// Identifier assigned by the dispatching agency.
    pub crime_id: Option<String>,
    /// Category label used as the aggregation key (e.g. `"Theft"`).
    pub original_crime_type_name: Option<String>,
    pub report_date: Option<String>,
    pub call_date: Option<String>,
    pub offense_date: Option<String>,
    pub call_time: Option<String>,
    /// When the call was placed. This is the event time.
    pub call_date_time: DateTime<Utc>,
    /// Radio disposition code (e.g. `"ADV"`, `"HAN"`), the reference join key.
    pub disposition: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub agency_id: Option<String>,
    pub address_type: Option<String>,
    pub common_location: Option<String>,
}

impl ServiceCall {
    /// Promotes a wire record using an already-parsed event time.
    #[must_use]
    pub fn from_raw(raw: RawServiceCall, call_date_time: DateTime<Utc>) -> Self {
        Self {
            crime_id: raw.crime_id,
            original_crime_type_name: raw.original_crime_type_name,
            report_date: raw.report_date,
            call_date: raw.call_date,
            offense_date: raw.offense_date,
            call_time: raw.call_time,
            call_date_time,
            disposition: raw.disposition,
            address: raw.address,
            city: raw.city,
            state: raw.state,
            agency_id: raw.agency_id,
            address_type: raw.address_type,
            common_location: raw.common_location,
        }
    }

    /// Returns the event time of this call.
    #[must_use]
    pub const fn event_time(&self) -> DateTime<Utc> {
        self.call_date_time
    }

    /// Returns the category label, or an empty string when the source left
    /// it blank.
    #[must_use]
    pub fn category_label(&self) -> &str {
        self.original_crime_type_name.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_call_tolerates_missing_fields() {
        let raw: RawServiceCall =
            serde_json::from_str(r#"{"crime_id": "183653763", "disposition": "ADV"}"#).unwrap();
        assert_eq!(raw.crime_id.as_deref(), Some("183653763"));
        assert_eq!(raw.disposition.as_deref(), Some("ADV"));
        assert!(raw.call_date_time.is_none());
    }

    #[test]
    fn blank_category_label_is_empty() {
        let call = ServiceCall::from_raw(RawServiceCall::default(), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(call.category_label(), "");
    }
}
