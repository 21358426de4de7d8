#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Radio disposition-code reference data.
//!
//! The reference file is a JSON array of objects, each carrying a
//! `disposition_code` plus descriptive fields:
//!
//! ```json
//! [{"disposition_code": "ADM", "description": "Admonished"}]
//! ```
//!
//! On load the code column is renamed to `disposition` and every other
//! scalar is kept as a string. The table is loaded once and never changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crime_stream_aggregate_models::EmittedRecord;
use serde::Serialize;
use serde_json::Value;

/// Column holding the join key in the reference file.
pub const SOURCE_KEY_COLUMN: &str = "disposition_code";

/// Name the join key is exposed under after loading.
pub const KEY_COLUMN: &str = "disposition";

/// Errors raised while loading reference data.
#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    /// The reference file could not be read.
    #[error("failed to read reference file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The reference file is not valid JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The document is well-formed but not shaped like a reference table.
    #[error("invalid reference data: {message}")]
    Invalid {
        /// Description of what went wrong.
        message: String,
    },
}

/// One reference row: the disposition code and its descriptive fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceRow {
    /// The join key.
    pub disposition: String,
    /// Descriptive columns, keyed by column name.
    pub fields: BTreeMap<String, String>,
}

/// An immutable, fully resident lookup from disposition code to reference
/// row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceTable {
    rows: BTreeMap<String, ReferenceRow>,
}

impl ReferenceTable {
    /// Reads and parses the reference file at `path`.
    ///
    /// # Errors
    ///
    /// * If the file cannot be read
    /// * If the contents are not a JSON array of objects with a
    ///   `disposition_code`
    pub fn load(path: &Path) -> Result<Self, ReferenceError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ReferenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_json_str(&contents)?;
        log::info!(
            "Loaded {} disposition codes from {}",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// Parses a reference document.
    ///
    /// # Errors
    ///
    /// Returns [`ReferenceError`] if the document is not a JSON array of
    /// objects each carrying a `disposition_code`.
    pub fn from_json_str(json: &str) -> Result<Self, ReferenceError> {
        let Value::Array(items) = serde_json::from_str::<Value>(json)? else {
            return Err(ReferenceError::Invalid {
                message: "expected a JSON array of reference rows".to_string(),
            });
        };

        let mut rows = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let Value::Object(object) = item else {
                return Err(ReferenceError::Invalid {
                    message: format!("row {index} is not an object"),
                });
            };

            let mut disposition = None;
            let mut fields = BTreeMap::new();
            for (column, value) in object {
                let Some(value) = stringify(value) else {
                    continue;
                };
                if column == SOURCE_KEY_COLUMN {
                    disposition = Some(value);
                } else {
                    fields.insert(column, value);
                }
            }

            let Some(disposition) = disposition else {
                return Err(ReferenceError::Invalid {
                    message: format!("row {index} has no {SOURCE_KEY_COLUMN}"),
                });
            };
            rows.push(ReferenceRow {
                disposition,
                fields,
            });
        }

        Ok(Self::from_rows(rows))
    }

    /// Builds a table from already-parsed rows. When a code repeats, the
    /// first row wins.
    #[must_use]
    pub fn from_rows(rows: impl IntoIterator<Item = ReferenceRow>) -> Self {
        let mut table = BTreeMap::new();
        for row in rows {
            if table.contains_key(&row.disposition) {
                log::warn!("Ignoring duplicate disposition code {:?}", row.disposition);
                continue;
            }
            table.insert(row.disposition.clone(), row);
        }
        Self { rows: table }
    }

    /// Looks up a disposition code. Matching is exact and case-sensitive.
    #[must_use]
    pub fn get(&self, disposition: &str) -> Option<&ReferenceRow> {
        self.rows.get(disposition)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Every descriptive column name appearing in any row, sorted.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self
            .rows
            .values()
            .flat_map(|row| row.fields.keys().map(String::as_str))
            .collect();
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    /// Enriches `record` with the row matching its disposition code.
    ///
    /// Records without a disposition, or whose code is not in the table,
    /// pass through as [`JoinedRecord::Miss`] with their count unchanged.
    #[must_use]
    pub fn join(&self, record: EmittedRecord) -> JoinedRecord {
        let row = record
            .id
            .key
            .disposition
            .as_deref()
            .and_then(|code| self.get(code));

        match row {
            Some(row) => JoinedRecord::Enriched {
                record,
                reference: row.clone(),
            },
            None => JoinedRecord::Miss { record },
        }
    }
}

/// Converts a JSON value to its string form. `null` has no value.
fn stringify(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// An aggregate after the reference join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinedRecord {
    /// The disposition code matched a reference row.
    Enriched {
        record: EmittedRecord,
        reference: ReferenceRow,
    },
    /// No reference row matched. The aggregate is passed through untouched.
    Miss { record: EmittedRecord },
}

impl JoinedRecord {
    /// The underlying aggregate.
    #[must_use]
    pub const fn record(&self) -> &EmittedRecord {
        match self {
            Self::Enriched { record, .. } | Self::Miss { record } => record,
        }
    }

    /// The matched reference row, if any.
    #[must_use]
    pub const fn reference(&self) -> Option<&ReferenceRow> {
        match self {
            Self::Enriched { reference, .. } => Some(reference),
            Self::Miss { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_miss(&self) -> bool {
        matches!(self, Self::Miss { .. })
    }
}
