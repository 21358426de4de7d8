#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Output sinks.
//!
//! Every emitted aggregate is flattened into an [`OutputRow`] and handed to a
//! [`Sink`] one trigger batch at a time. Sinks report I/O failures for the
//! batch as a whole; a single row that cannot be rendered is logged and
//! skipped.

pub mod console;
pub mod jsonl;
pub mod memory;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crime_stream_aggregate_models::EmittedRecord;
use crime_stream_reference::JoinedRecord;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use console::ConsoleSink;
pub use jsonl::JsonLinesSink;
pub use memory::CollectingSink;

/// Errors raised by sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Writing to the sink's destination failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The sink was configured incorrectly.
    #[error("invalid sink configuration: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },
}

/// Which sink implementation to write to.
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
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum SinkKind {
    /// Tables printed to stdout.
    #[default]
    Console,
    /// One JSON object per line appended to a file.
    JsonLines,
}

/// Columns every [`OutputRow`] writes itself.
pub const OUTPUT_COLUMNS: [&str; 6] = [
    "window_start",
    "window_end",
    "category_label",
    "disposition",
    "count",
    "final",
];

/// Prefix given to reference columns named like an [`OUTPUT_COLUMNS`] entry.
pub const REFERENCE_COLUMN_PREFIX: &str = "reference_";

/// Name a reference column is written under. Columns that would shadow an
/// output column are prefixed with [`REFERENCE_COLUMN_PREFIX`].
#[must_use]
pub fn reference_column_name(column: &str) -> Cow<'_, str> {
    if OUTPUT_COLUMNS.contains(&column) {
        Cow::Owned(format!("{REFERENCE_COLUMN_PREFIX}{column}"))
    } else {
        Cow::Borrowed(column)
    }
}

/// A flattened aggregate row as written by every sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRow {
    /// Inclusive window start.
    pub window_start: DateTime<Utc>,
    /// Exclusive window end.
    pub window_end: DateTime<Utc>,
    pub category_label: String,
    /// Present when aggregates are grouped by disposition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    pub count: u64,
    /// `false` for in-progress complete-mode snapshots.
    #[serde(rename = "final")]
    pub is_final: bool,
    /// Reference columns, present only for enriched rows. Never holds an
    /// [`OUTPUT_COLUMNS`] name.
    #[serde(flatten)]
    pub reference: BTreeMap<String, String>,
}

impl From<EmittedRecord> for OutputRow {
    fn from(record: EmittedRecord) -> Self {
        Self {
            window_start: record.id.window.start,
            window_end: record.id.window.end,
            category_label: record.id.key.category,
            disposition: record.id.key.disposition,
            count: record.count,
            is_final: record.is_final,
            reference: BTreeMap::new(),
        }
    }
}

impl From<JoinedRecord> for OutputRow {
    fn from(joined: JoinedRecord) -> Self {
        match joined {
            JoinedRecord::Enriched { record, reference } => {
                let mut row = Self::from(record);
                for (column, value) in reference.fields {
                    let name = reference_column_name(&column).into_owned();
                    if name == column {
                        row.reference.insert(name, value);
                    } else {
                        // A reference column already named like the prefixed one wins.
                        row.reference.entry(name).or_insert(value);
                    }
                }
                row
            }
            JoinedRecord::Miss { record } => Self::from(record),
        }
    }
}

/// A destination for aggregate rows.
#[async_trait]
pub trait Sink: Send {
    /// Writes one trigger's rows.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the destination could not be written.
    async fn emit_batch(&mut self, rows: &[OutputRow]) -> Result<(), SinkError>;

    /// Flushes buffered output.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if buffered output could not be written.
    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Options for [`open_sink`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkOptions {
    pub kind: SinkKind,
    /// Output file for [`SinkKind::JsonLines`].
    pub path: Option<PathBuf>,
    /// Shorten long console cells.
    pub truncate: bool,
}

/// Opens the sink described by `options`.
///
/// # Errors
///
/// * If a JSON-lines sink has no path
/// * If the output file cannot be opened
pub async fn open_sink(options: &SinkOptions) -> Result<Box<dyn Sink>, SinkError> {
    match options.kind {
        SinkKind::Console => Ok(Box::new(ConsoleSink::stdout(options.truncate))),
        SinkKind::JsonLines => {
            let Some(path) = &options.path else {
                return Err(SinkError::Config {
                    message: "the json-lines sink needs an output path".to_string(),
                });
            };
            Ok(Box::new(JsonLinesSink::open(path).await?))
        }
    }
}


#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use crime_stream_aggregate_models::{GroupKey, TimeWindow, WindowId};
    use crime_stream_reference::ReferenceRow;

    use super::*;

    fn record() -> EmittedRecord {
        EmittedRecord {
            id: WindowId {
                window: TimeWindow {
                    start: Utc.with_ymd_and_hms(2018, 12, 31, 10, 0, 0).unwrap(),
                    end: Utc.with_ymd_and_hms(2018, 12, 31, 11, 0, 0).unwrap(),
                },
                key: GroupKey {
                    category: "Theft".to_string(),
                    disposition: Some("ADM".to_string()),
                },
            },
            count: 3,
            is_final: true,
        }
    }

    #[test]
    fn enriched_row_serializes_reference_columns_inline() {
        let joined = JoinedRecord::Enriched {
            record: record(),
            reference: ReferenceRow {
                disposition: "ADM".to_string(),
                fields: BTreeMap::from([("description".to_string(), "Admonished".to_string())]),
            },
        };
        let value = serde_json::to_value(OutputRow::from(joined)).unwrap();
        assert_eq!(value["category_label"], "Theft");
        assert_eq!(value["disposition"], "ADM");
        assert_eq!(value["count"], 3);
        assert_eq!(value["final"], true);
        assert_eq!(value["description"], "Admonished");
        assert_eq!(value["window_start"], "2018-12-31T10:00:00Z");
    }

    #[test]
    fn reference_columns_never_shadow_output_columns() {
        let joined = JoinedRecord::Enriched {
            record: record(),
            reference: ReferenceRow {
                disposition: "ADM".to_string(),
                fields: BTreeMap::from([
                    ("count".to_string(), "lots".to_string()),
                    ("final".to_string(), "no".to_string()),
                    ("description".to_string(), "Admonished".to_string()),
                ]),
            },
        };
        let line = serde_json::to_string(&OutputRow::from(joined)).unwrap();
        assert_eq!(line.matches("\"count\":").count(), 1);

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["count"], 3);
        assert_eq!(value["final"], true);
        assert_eq!(value["reference_count"], "lots");
        assert_eq!(value["reference_final"], "no");
        assert_eq!(value["description"], "Admonished");
    }

    #[test]
    fn reference_column_names_are_prefixed_only_on_collision() {
        assert_eq!(reference_column_name("description"), "description");
        assert_eq!(reference_column_name("count"), "reference_count");
        assert_eq!(
            reference_column_name("category_label"),
            "reference_category_label"
        );
    }

    #[test]
    fn miss_keeps_count_and_has_no_reference_columns() {
        let row = OutputRow::from(JoinedRecord::Miss { record: record() });
        assert_eq!(row.count, 3);
        assert!(row.reference.is_empty());
    }

    #[test]
    fn sink_kind_parses_from_config_strings() {
        assert_eq!("console".parse::<SinkKind>().unwrap(), SinkKind::Console);
        assert_eq!(
            "json-lines".parse::<SinkKind>().unwrap(),
            SinkKind::JsonLines
        );
        assert_eq!(SinkKind::JsonLines.to_string(), "json-lines");
    }

    #[tokio::test]
    async fn json_lines_sink_requires_a_path() {
        let result = open_sink(&SinkOptions {
            kind: SinkKind::JsonLines,
            ..SinkOptions::default()
        })
        .await;
        assert!(matches!(result, Err(SinkError::Config { .. })));
    }
}
