//! Append-only file log transport.
//!
//! A [`FileLog`] is a directory holding one `<topic>.log` file per topic.
//! Every line of a log file is one message; its zero-based line number is
//! its offset in partition `0`. Consumer-group commits are stored in
//! `<topic>.<group>.offset` files containing the next offset to read.
//!
//! Payloads must not contain newlines, which compact JSON never does. Only
//! one producing process should append to a directory at a time.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crime_stream_channel_models::{MessagePosition, RawMessage, StartPosition};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{ChannelConsumer, ChannelError, ChannelProducer, OffsetTracker};

/// The only partition a file log has.
pub const FILE_PARTITION: i32 = 0;

/// How often a consumer re-reads its log file while waiting for data.
const TAIL_INTERVAL: Duration = Duration::from_millis(50);

/// A directory of append-only topic logs.
#[derive(Debug, Clone)]
pub struct FileLog {
    dir: PathBuf,
    /// Next offset per topic, cached on first append. Also serializes
    /// appends from producers sharing this handle.
    next_offsets: Arc<Mutex<HashMap<String, i64>>>,
}

impl FileLog {
    /// Opens (creating if needed) the log directory at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connection`] if the directory cannot be
    /// created.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ChannelError::Connection {
                message: format!("cannot create log directory {}: {e}", dir.display()),
            })?;
        Ok(Self {
            dir,
            next_offsets: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Directory backing this log.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, topic: &str) -> PathBuf {
        self.dir.join(format!("{topic}.log"))
    }

    fn offset_path(&self, topic: &str, group: &str) -> PathBuf {
        self.dir.join(format!("{topic}.{group}.offset"))
    }

    /// Creates a producer appending to this log.
    #[must_use]
    pub fn producer(&self) -> FileProducer {
        FileProducer { log: self.clone() }
    }

    /// Reads the committed next offset of `group`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the offset file exists but cannot be read
    /// or parsed.
    pub async fn committed(&self, topic: &str, group: &str) -> Result<Option<i64>, ChannelError> {
        match tokio::fs::read_to_string(self.offset_path(topic, group)).await {
            Ok(text) => text
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|e| ChannelError::Connection {
                    message: format!("corrupt offset file for {topic}/{group}: {e}"),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Subscribes to `topic` as a member of `group`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the log or offset files cannot be read.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<FileConsumer, ChannelError> {
        let start_offset = match start {
            StartPosition::Earliest => 0,
            StartPosition::Latest => count_lines(&self.log_path(topic)).await?,
            StartPosition::Committed => self.committed(topic, group).await?.unwrap_or(0),
            StartPosition::Offset(n) => n,
        };

        Ok(FileConsumer {
            log: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            byte_pos: 0,
            line_offset: 0,
            skip_until: start_offset,
        })
    }
}

async fn count_lines(path: &Path) -> Result<i64, ChannelError> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut lines = 0_i64;
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(lines);
        }
        let len = buf.len();
        let newlines = buf.iter().filter(|b| **b == b'\n').count();
        lines = lines.saturating_add(i64::try_from(newlines).unwrap_or(i64::MAX));
        reader.consume(len);
    }
}

/// Producer half of a [`FileLog`].
#[derive(Debug, Clone)]
pub struct FileProducer {
    log: FileLog,
}

#[async_trait]
impl ChannelProducer for FileProducer {
    async fn send(
        &self,
        topic: &str,
        _key: Option<&str>,
        payload: &[u8],
    ) -> Result<MessagePosition, ChannelError> {
        if payload.contains(&b'\n') {
            return Err(ChannelError::Rejected {
                message: "file log payloads must not contain newlines".to_string(),
            });
        }

        let mut next_offsets = self.log.next_offsets.lock().await;
        let path = self.log.log_path(topic);
        let offset = match next_offsets.get(topic) {
            Some(offset) => *offset,
            None => count_lines(&path).await?,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        next_offsets.insert(topic.to_string(), offset + 1);
        drop(next_offsets);

        Ok(MessagePosition {
            partition: FILE_PARTITION,
            offset,
        })
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Consumer half of a [`FileLog`]. Tails the topic's log file.
///
/// Each poll reads at most the requested number of lines from disk; nothing
/// beyond the returned batch is buffered.
#[derive(Debug)]
pub struct FileConsumer {
    log: FileLog,
    topic: String,
    group: String,
    /// Byte position of the first unread line.
    byte_pos: u64,
    /// Offset of the line starting at `byte_pos`.
    line_offset: i64,
    /// Lines before this offset are skipped (start position).
    skip_until: i64,
}

impl FileConsumer {
    async fn read_lines(&mut self, max_records: usize) -> Result<Vec<RawMessage>, ChannelError> {
        let path = self.log.log_path(&self.topic);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(self.byte_pos)).await?;
        let mut reader = BufReader::new(file);

        let mut messages = Vec::new();
        let mut line = Vec::new();
        while messages.len() < max_records {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).await?;
            // A trailing partial line is left for the next read.
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            line.pop();

            let offset = self.line_offset;
            self.line_offset += 1;
            self.byte_pos += u64::try_from(read).unwrap_or(u64::MAX);
            if offset < self.skip_until {
                continue;
            }
            messages.push(RawMessage {
                topic: self.topic.clone(),
                position: MessagePosition {
                    partition: FILE_PARTITION,
                    offset,
                },
                payload: line.clone(),
            });
        }

        Ok(messages)
    }
}

#[async_trait]
impl ChannelConsumer for FileConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, ChannelError> {
        if max_records == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let messages = self.read_lines(max_records).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(TAIL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn commit(&mut self, offsets: &OffsetTracker) -> Result<(), ChannelError> {
        let Some(next) = offsets
            .commit_positions()
            .filter(|(topic, partition, _)| *topic == self.topic && *partition == FILE_PARTITION)
            .map(|(_, _, next)| next)
            .max()
        else {
            return Ok(());
        };

        let path = self.log.offset_path(&self.topic, &self.group);
        let tmp = path.with_extension("offset.tmp");
        tokio::fs::write(&tmp, next.to_string()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        log::debug!("Committed {}/{} at offset {next}", self.topic, self.group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_log() -> FileLog {
        let dir = std::env::temp_dir().join(format!("crime_stream_file_log_{}", uuid::Uuid::new_v4()));
        FileLog::open(&dir).await.unwrap()
    }

    #[tokio::test]
    async fn appends_and_tails_lines() {
        let log = temp_log().await;
        let producer = log.producer();
        assert_eq!(
            producer.send("calls", None, b"{\"a\":1}").await.unwrap().offset,
            0
        );
        assert_eq!(
            producer.send("calls", None, b"{\"a\":2}").await.unwrap().offset,
            1
        );

        let mut consumer = log.subscribe("calls", "g", StartPosition::Earliest).await.unwrap();
        let messages = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].payload, b"{\"a\":2}");
        assert_eq!(messages[1].position.offset, 1);

        producer.send("calls", None, b"{\"a\":3}").await.unwrap();
        let messages = consumer.poll(10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].position.offset, 2);

        tokio::fs::remove_dir_all(log.dir()).await.ok();
    }

    #[tokio::test]
    async fn rejects_payloads_with_newlines() {
        let log = temp_log().await;
        let err = log.producer().send("calls", None, b"a\nb").await.unwrap_err();
        assert!(matches!(err, ChannelError::Rejected { .. }));
        tokio::fs::remove_dir_all(log.dir()).await.ok();
    }

    #[tokio::test]
    async fn commit_and_resume() {
        let log = temp_log().await;
        let producer = log.producer();
        for i in 0..5 {
            producer
                .send("calls", None, format!("{i}").as_bytes())
                .await
                .unwrap();
        }

        let mut consumer = log.subscribe("calls", "g", StartPosition::Earliest).await.unwrap();
        let first = consumer.poll(3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 3);
        let mut tracker = OffsetTracker::new();
        tracker.observe(&first);
        consumer.commit(&tracker).await.unwrap();
        assert_eq!(log.committed("calls", "g").await.unwrap(), Some(3));

        let mut resumed = log.subscribe("calls", "g", StartPosition::Committed).await.unwrap();
        let rest = resumed.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(
            rest.iter().map(|m| m.payload.clone()).collect::<Vec<_>>(),
            vec![b"3".to_vec(), b"4".to_vec()]
        );

        let mut latest = log.subscribe("calls", "g", StartPosition::Latest).await.unwrap();
        assert!(latest.poll(10, Duration::from_millis(10)).await.unwrap().is_empty());

        let mut from_offset = log.subscribe("calls", "g", StartPosition::Offset(4)).await.unwrap();
        assert_eq!(from_offset.poll(10, Duration::from_millis(10)).await.unwrap().len(), 1);

        tokio::fs::remove_dir_all(log.dir()).await.ok();
    }

    #[tokio::test]
    async fn reads_no_further_than_the_requested_batch() {
        let log = temp_log().await;
        let producer = log.producer();
        for i in 0..1_000 {
            producer
                .send("calls", None, format!("{i:05}").as_bytes())
                .await
                .unwrap();
        }

        let mut consumer = log.subscribe("calls", "g", StartPosition::Earliest).await.unwrap();
        let first = consumer.poll(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, b"00000");
        // The cursor sits right after the one line returned.
        assert_eq!(consumer.line_offset, 1);
        assert_eq!(consumer.byte_pos, 6);

        let next = consumer.poll(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(
            next.iter().map(|m| m.position.offset).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(consumer.line_offset, 3);
        assert_eq!(consumer.byte_pos, 18);

        assert_eq!(count_lines(&log.log_path("calls")).await.unwrap(), 1_000);

        tokio::fs::remove_dir_all(log.dir()).await.ok();
    }

    #[tokio::test]
    async fn leaves_a_partial_line_for_the_next_poll() {
        let log = temp_log().await;
        let path = log.log_path("calls");
        tokio::fs::write(&path, b"{\"a\":1}\n{\"a\":").await.unwrap();

        let mut consumer = log.subscribe("calls", "g", StartPosition::Earliest).await.unwrap();
        let messages = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(messages.len(), 1);

        let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"2}\n").await.unwrap();
        file.flush().await.unwrap();

        let messages = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"{\"a\":2}");
        assert_eq!(messages[0].position.offset, 1);

        tokio::fs::remove_dir_all(log.dir()).await.ok();
    }

    #[tokio::test]
    async fn missing_log_polls_empty() {
        let log = temp_log().await;
        let mut consumer = log.subscribe("nothing", "g", StartPosition::Earliest).await.unwrap();
        assert!(consumer.poll(10, Duration::from_millis(5)).await.unwrap().is_empty());
        tokio::fs::remove_dir_all(log.dir()).await.ok();
    }
}
