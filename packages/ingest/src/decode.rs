//! Schema decoding for service-call messages.

use crime_stream_event_models::{RawServiceCall, ServiceCall};

use crate::parsing::parse_call_date_time;

/// Why a message could not be decoded. Decode errors are permanent for the
/// message that caused them and are never retried.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// The payload is not a JSON object matching the schema.
    #[error("payload does not match the service-call schema: {0}")]
    Schema(#[from] serde_json::Error),

    /// `call_date_time` is absent or null.
    #[error("missing call_date_time")]
    MissingEventTime,

    /// `call_date_time` is present but not a timestamp.
    #[error("unparseable call_date_time {0:?}")]
    InvalidEventTime(String),
}

/// Decodes one payload into a [`ServiceCall`].
///
/// # Errors
///
/// Returns [`DecodeError`] if the payload is not a UTF-8 JSON object
/// matching the schema, or its event time is missing or unparseable.
pub fn decode_service_call(payload: &[u8]) -> Result<ServiceCall, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let raw: RawServiceCall = serde_json::from_str(text)?;
    let event_time = match raw.call_date_time.as_deref() {
        None => return Err(DecodeError::MissingEventTime),
        Some(s) => parse_call_date_time(s).ok_or_else(|| DecodeError::InvalidEventTime(s.to_string()))?,
    };
    Ok(ServiceCall::from_raw(raw, event_time))
}
