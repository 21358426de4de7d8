//! Tabular console output.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{OutputRow, Sink, SinkError};

/// Cells longer than this are shortened when truncation is on.
pub const TRUNCATE_WIDTH: usize = 20;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Prints each batch as a boxed table.
pub struct ConsoleSink<W = tokio::io::Stdout> {
    out: W,
    truncate: bool,
    batch: u64,
}

impl ConsoleSink {
    /// A console sink writing to stdout.
    #[must_use]
    pub fn stdout(truncate: bool) -> Self {
        Self::new(tokio::io::stdout(), truncate)
    }
}

impl<W> ConsoleSink<W> {
    #[must_use]
    pub const fn new(out: W, truncate: bool) -> Self {
        Self {
            out,
            truncate,
            batch: 0,
        }
    }

    /// Consumes the sink and returns its writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sink for ConsoleSink<W> {
    async fn emit_batch(&mut self, rows: &[OutputRow]) -> Result<(), SinkError> {
        let rule = "-".repeat(43);
        let text = format!(
            "{rule}\nBatch: {}\n{rule}\n{}\n",
            self.batch,
            render_table(rows, self.truncate)
        );
        self.batch += 1;
        self.out.write_all(text.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.out.flush().await?;
        Ok(())
    }
}

/// Renders `rows` as a table. Reference columns are the union of every
/// row's reference fields.
#[must_use]
pub fn render_table(rows: &[OutputRow], truncate: bool) -> String {
    let extra: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.reference.keys().map(String::as_str))
        .collect();
    let with_disposition = rows.iter().any(|row| row.disposition.is_some());

    let mut header = vec!["window_start", "window_end", "category_label"];
    if with_disposition {
        header.push("disposition");
    }
    header.extend(["count", "final"]);
    header.extend(extra.iter().copied());

    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            let mut cells = vec![
                row.window_start.format(TIME_FORMAT).to_string(),
                row.window_end.format(TIME_FORMAT).to_string(),
                row.category_label.clone(),
            ];
            if with_disposition {
                cells.push(row.disposition.clone().unwrap_or_else(|| "null".to_string()));
            }
            cells.push(row.count.to_string());
            cells.push(row.is_final.to_string());
            for column in &extra {
                cells.push(
                    row.reference
                        .get(*column)
                        .cloned()
                        .unwrap_or_else(|| "null".to_string()),
                );
            }
            cells
                .into_iter()
                .map(|cell| if truncate { shorten(&cell) } else { cell })
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for cells in &body {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let separator = widths.iter().fold(String::from("+"), |mut line, width| {
        line.push_str(&"-".repeat(*width));
        line.push('+');
        line
    });

    let mut lines = vec![separator.clone(), format_line(&header, &widths), separator.clone()];
    for cells in &body {
        lines.push(format_line(cells, &widths));
    }
    lines.push(separator);
    lines.join("\n")
}

fn format_line<S: AsRef<str>>(cells: &[S], widths: &[usize]) -> String {
    let mut line = String::from("|");
    for (cell, &width) in cells.iter().zip(widths) {
        line.push_str(&format!("{:>width$}|", cell.as_ref()));
    }
    line
}

fn shorten(cell: &str) -> String {
    if cell.chars().count() <= TRUNCATE_WIDTH {
        return cell.to_string();
    }
    let mut short: String = cell.chars().take(TRUNCATE_WIDTH - 3).collect();
    short.push_str("...");
    short
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::test_rows::row;

    #[test]
    fn renders_header_and_rows() {
        let table = render_table(&[row("Theft", 3), row("Assault", 12)], false);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[1].contains("category_label"));
        assert!(!lines[1].contains("disposition"));
        assert!(lines[3].contains("2018-12-31 10:00:00"));
        assert!(lines[3].contains("Theft"));
        assert!(lines[4].contains("12"));
        assert!(lines.iter().all(|l| l.len() == lines[0].len()));
    }

    #[test]
    fn truncates_long_cells() {
        let long = "Passing Call With An Exceptionally Long Label";
        let table = render_table(&[row(long, 1)], true);
        assert!(!table.contains(long));
        assert!(table.contains("Passing Call With..."));

        let full = render_table(&[row(long, 1)], false);
        assert!(full.contains(long));
    }

    #[test]
    fn reference_columns_are_unioned() {
        let mut enriched = row("Theft", 2);
        enriched.disposition = Some("ADM".to_string());
        enriched.reference =
            BTreeMap::from([("description".to_string(), "Admonished".to_string())]);
        let mut miss = row("Theft", 5);
        miss.disposition = Some("ADV".to_string());

        let table = render_table(&[enriched, miss], false);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[1].contains("disposition"));
        assert!(lines[1].contains("description"));
        assert!(lines[3].contains("Admonished"));
        assert!(lines[4].contains("null"));
    }

    #[tokio::test]
    async fn numbers_each_batch() {
        let mut sink = ConsoleSink::new(Vec::new(), false);
        sink.emit_batch(&[row("Theft", 1)]).await.unwrap();
        sink.emit_batch(&[]).await.unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert!(out.contains("Batch: 0"));
        assert!(out.contains("Batch: 1"));
    }
}
