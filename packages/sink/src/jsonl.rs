//! JSON-lines file output.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::{OutputRow, Sink, SinkError};

/// Appends one JSON object per row to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonLinesSink {
    /// Opens `path` for appending, creating it and its parent directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the file cannot be opened.
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        log::info!("Writing aggregates to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    async fn emit_batch(&mut self, rows: &[OutputRow]) -> Result<(), SinkError> {
        for row in rows {
            let mut line = match serde_json::to_vec(row) {
                Ok(line) => line,
                Err(e) => {
                    log::warn!(
                        "Skipping unserializable row for {:?}: {e}",
                        row.category_label
                    );
                    continue;
                }
            };
            line.push(b'\n');
            self.out.write_all(&line).await?;
        }
        self.out.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.out.flush().await?;
        self.out.get_mut().sync_all().await?;
        Ok(())
    }
}
