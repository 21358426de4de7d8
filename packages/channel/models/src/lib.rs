#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Message, offset, and subscription types shared by every channel
//! transport.
//!
//! A channel is a durable, partitioned, append-only log. Each partition
//! assigns a monotonically increasing offset to every message it stores.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Position of a single message within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessagePosition {
    /// Partition the message was read from.
    pub partition: i32,
    /// Offset of the message within its partition.
    pub offset: i64,
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A message as delivered by a channel, before schema decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Topic the message was read from.
    pub topic: String,
    /// Where the message lives in the log.
    pub position: MessagePosition,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// Where a new subscription starts reading.
///
/// Serialized as `"earliest"`, `"latest"`, `"committed"`, or `"offset:<n>"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartPosition {
    /// Start from the first retained message of every partition.
    #[default]
    Earliest,
    /// Only deliver messages appended after subscribing.
    Latest,
    /// Resume from the consumer group's committed offsets, falling back to
    /// [`Self::Earliest`] for partitions that have never been committed.
    Committed,
    /// Start every partition at the given offset.
    Offset(i64),
}

/// Error returned when a [`StartPosition`] string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStartPosition {
    /// The rejected input.
    pub value: String,
}

impl fmt::Display for InvalidStartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid start position {:?}: expected earliest, latest, committed, or offset:<n>",
            self.value
        )
    }
}

impl std::error::Error for InvalidStartPosition {}

impl FromStr for StartPosition {
    type Err = InvalidStartPosition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "earliest" => return Ok(Self::Earliest),
            "latest" => return Ok(Self::Latest),
            "committed" => return Ok(Self::Committed),
            _ => {}
        }
        trimmed
            .strip_prefix("offset:")
            .and_then(|n| n.trim().parse::<i64>().ok())
            .filter(|n| *n >= 0)
            .map(Self::Offset)
            .ok_or_else(|| InvalidStartPosition {
                value: s.to_string(),
            })
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => f.write_str("earliest"),
            Self::Latest => f.write_str("latest"),
            Self::Committed => f.write_str("committed"),
            Self::Offset(n) => write!(f, "offset:{n}"),
        }
    }
}

impl TryFrom<String> for StartPosition {
    type Error = InvalidStartPosition;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StartPosition> for String {
    fn from(value: StartPosition) -> Self {
        value.to_string()
    }
}

/// The transport backing a channel address.
#[derive(
    Debug,
    Clone,
    Copy,
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
#[strum(serialize_all = "lowercase")]
pub enum TransportKind {
    /// In-process log, lost when the process exits.
    Memory,
    /// Append-only log files in a local directory.
    File,
    /// Apache Kafka cluster.
    Kafka,
}

/// A parsed channel address such as `file://./data/channel` or
/// `kafka://localhost:9092`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddress {
    /// Which transport to connect with.
    pub kind: TransportKind,
    /// Transport-specific location (directory, bootstrap servers, or a
    /// named in-memory log).
    pub location: String,
}

/// Error returned when a channel address cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidChannelAddress {
    /// The rejected input.
    pub value: String,
}

impl fmt::Display for InvalidChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid channel address {:?}: expected memory://, file://<dir>, or kafka://<servers>",
            self.value
        )
    }
}

impl std::error::Error for InvalidChannelAddress {}

impl FromStr for ChannelAddress {
    type Err = InvalidChannelAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidChannelAddress {
            value: s.to_string(),
        };
        let (scheme, location) = s.trim().split_once("://").ok_or_else(err)?;
        let kind = scheme.parse::<TransportKind>().map_err(|_| err())?;
        if location.is_empty() && kind != TransportKind::Memory {
            return Err(err());
        }
        Ok(Self {
            kind,
            location: location.to_string(),
        })
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_positions() {
        assert_eq!("earliest".parse(), Ok(StartPosition::Earliest));
        assert_eq!("LATEST".parse(), Ok(StartPosition::Latest));
        assert_eq!("committed".parse(), Ok(StartPosition::Committed));
        assert_eq!("offset:42".parse(), Ok(StartPosition::Offset(42)));
        assert!("offset:-1".parse::<StartPosition>().is_err());
        assert!("beginning".parse::<StartPosition>().is_err());
    }

    #[test]
    fn start_position_deserializes_from_toml_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            start: StartPosition,
        }
        let w: Wrapper = toml::from_str(r#"start = "offset:7""#).unwrap();
        assert_eq!(w.start, StartPosition::Offset(7));
    }

    #[test]
    fn parses_channel_addresses() {
        let addr: ChannelAddress = "kafka://localhost:9092".parse().unwrap();
        assert_eq!(addr.kind, TransportKind::Kafka);
        assert_eq!(addr.location, "localhost:9092");

        let addr: ChannelAddress = "memory://".parse().unwrap();
        assert_eq!(addr.kind, TransportKind::Memory);

        assert!("file://".parse::<ChannelAddress>().is_err());
        assert!("localhost:9092".parse::<ChannelAddress>().is_err());
        assert!("redis://localhost".parse::<ChannelAddress>().is_err());
    }

    #[test]
    fn channel_address_display_round_trips() {
        let addr: ChannelAddress = "file://./data/channel".parse().unwrap();
        assert_eq!(addr.to_string(), "file://./data/channel");
    }
}
