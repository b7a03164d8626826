//! JSON-file log storage.
//!
//! This module provides:
//! - [`JsonFileLogger`]: appends one JSON object per record to a file and
//!   streams the file back, optionally following new writes
//! - [`JsonFileStoreFactory`]: creates a logger at the path resolved for
//!   each stream
//!
//! Each line has the shape `{"log":"...","stream":"stdout","time":"..."}`.
//! Complete records carry a trailing newline inside `log`. Partial records
//! carry none and are also marked `"partial":true`, so a fragment that itself
//! ends in a newline survives a round trip. Lines without the marker are
//! partial when `log` lacks the trailing newline.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::config::DriverConfig;
use crate::error::{LogDriverError, Result};
use crate::traits::{LogReader, LogStoreFactory, LogWriter, StorageLogger};
use crate::types::{LogRecord, ReadConfig, StreamMetadata};
use crate::watcher::{LogWatcher, WatcherSender};

/// One line of the log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JsonLine {
    log: String,
    stream: String,
    time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    partial: bool,
}

impl From<&LogRecord> for JsonLine {
    fn from(record: &LogRecord) -> Self {
        let mut log = record.line_lossy().into_owned();
        if !record.partial {
            log.push('\n');
        }
        Self {
            log,
            stream: record.source.clone(),
            time: record.timestamp(),
            partial: record.partial,
        }
    }
}

impl From<JsonLine> for LogRecord {
    fn from(line: JsonLine) -> Self {
        let JsonLine {
            mut log,
            stream,
            time,
            partial,
        } = line;
        let partial = partial || !log.ends_with('\n');
        if !partial {
            log.pop();
        }
        Self::at(log, stream, time).with_partial(partial)
    }
}

/// File-backed, read-capable storage logger.
///
/// [`LogWriter::write`] appends and flushes one line on the calling thread.
/// Ingestion calls it from a runtime worker, so the file should live on a
/// local filesystem. Reads run on the runtime through `tokio::fs`.
pub struct JsonFileLogger {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    closed: Arc<AtomicBool>,
    poll_interval: Duration,
    buffer: usize,
}

impl JsonFileLogger {
    /// Opens (or creates) the log file for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>, poll_interval: Duration, buffer: usize) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogDriverError::setup("error creating jsonfile logger", e))?;

        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            closed: Arc::new(AtomicBool::new(false)),
            poll_interval,
            buffer: buffer.max(1),
        })
    }

    /// Returns the log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogWriter for JsonFileLogger {
    fn write(&self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&JsonLine::from(record))?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or(LogDriverError::StreamClosed)?;
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let writer = self.writer.lock().take();
        self.closed.store(true, Ordering::Release);
        if let Some(mut writer) = writer {
            writer.flush()?;
        }
        Ok(())
    }
}

impl LogReader for JsonFileLogger {
    fn read_logs(&self, config: &ReadConfig) -> LogWatcher {
        let (sender, watcher) = LogWatcher::channel(self.buffer);
        let reader = FileReader {
            path: self.path.clone(),
            config: config.clone(),
            closed: Arc::clone(&self.closed),
            poll_interval: self.poll_interval,
            pending: String::new(),
        };
        tokio::spawn(reader.run(sender));
        watcher
    }
}

/// Streams one log file into a watcher.
struct FileReader {
    path: PathBuf,
    config: ReadConfig,
    closed: Arc<AtomicBool>,
    poll_interval: Duration,
    /// Bytes of a line whose newline has not been written yet.
    pending: String,
}

impl FileReader {
    async fn run(mut self, sender: WatcherSender) {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) => {
                sender.fail(e.into()).await;
                return;
            }
        };
        let mut reader = BufReader::new(file);

        if let Err(e) = self.send_history(&mut reader, &sender).await {
            if !matches!(e, LogDriverError::StreamClosed) {
                sender.fail(e).await;
            }
            return;
        }

        if !self.config.follow {
            return;
        }

        if let Err(e) = self.follow(&mut reader, &sender).await {
            if !matches!(e, LogDriverError::StreamClosed) {
                sender.fail(e).await;
            }
        }
    }

    async fn send_history(
        &mut self,
        reader: &mut BufReader<tokio::fs::File>,
        sender: &WatcherSender,
    ) -> Result<()> {
        let mut tail = self.config.tail.map(|n| VecDeque::with_capacity(n.min(1024)));

        while let Some(record) = self.next_record(reader).await? {
            if !self.config.in_window(record.timestamp()) {
                continue;
            }
            match tail.as_mut() {
                Some(kept) => {
                    kept.push_back(record);
                    if self.config.tail.is_some_and(|n| kept.len() > n) {
                        kept.pop_front();
                    }
                }
                None => sender.send(record).await?,
            }
        }

        for record in tail.into_iter().flatten() {
            sender.send(record).await?;
        }
        Ok(())
    }

    async fn follow(
        &mut self,
        reader: &mut BufReader<tokio::fs::File>,
        sender: &WatcherSender,
    ) -> Result<()> {
        let mut saw_close = false;
        loop {
            if let Some(record) = self.next_record(reader).await? {
                let timestamp = record.timestamp();
                if self.config.is_past_until(timestamp) {
                    return Ok(());
                }
                if self.config.in_window(timestamp) {
                    sender.send(record).await?;
                }
                continue;
            }

            // One more pass after the writer closed picks up its final flush.
            if saw_close {
                debug!(path = %self.path.display(), "log file closed, ending follow");
                return Ok(());
            }
            saw_close = self.closed.load(Ordering::Acquire);
            if saw_close {
                continue;
            }

            tokio::select! {
                () = sender.closed() => return Ok(()),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Reads the next complete, decodable record. `None` means no complete
    /// line is available yet.
    async fn next_record(
        &mut self,
        reader: &mut BufReader<tokio::fs::File>,
    ) -> Result<Option<LogRecord>> {
        loop {
            let read = reader.read_line(&mut self.pending).await?;
            if read == 0 || !self.pending.ends_with('\n') {
                return Ok(None);
            }

            let line = std::mem::take(&mut self.pending);
            match serde_json::from_str::<JsonLine>(line.trim_end()) {
                Ok(parsed) => return Ok(Some(parsed.into())),
                Err(e) => warn!(
                    path = %self.path.display(),
                    error = %e,
                    "skipping undecodable log line"
                ),
            }
        }
    }
}

/// Creates a [`JsonFileLogger`] at each stream's resolved log path.
#[derive(Debug, Clone)]
pub struct JsonFileStoreFactory {
    poll_interval: Duration,
    buffer: usize,
}

impl Default for JsonFileStoreFactory {
    fn default() -> Self {
        Self::from_config(&DriverConfig::default())
    }
}

impl JsonFileStoreFactory {
    /// Creates a factory from driver configuration.
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            poll_interval: config.follow_poll_interval(),
            buffer: config.read_buffer,
        }
    }
}

impl LogStoreFactory for JsonFileStoreFactory {
    fn create(&self, metadata: &StreamMetadata) -> Result<StorageLogger> {
        let path = metadata
            .log_path
            .clone()
            .ok_or_else(|| LogDriverError::InvalidPath {
                path: PathBuf::new(),
                reason: format!("no log path resolved for container {}", metadata.container_id),
            })?;

        let logger = JsonFileLogger::open(path, self.poll_interval, self.buffer)?;
        Ok(StorageLogger::read_capable(logger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record_at(line: &str, source: &str, secs: i64, partial: bool) -> LogRecord {
        let time = Utc
            .timestamp_opt(1_700_000_000 + secs, 123_456_789)
            .single()
            .unwrap_or_default();
        LogRecord::at(line, source, time).with_partial(partial)
    }

    fn logger_in(dir: &TempDir) -> JsonFileLogger {
        JsonFileLogger::open(dir.path().join("application.log"), Duration::from_millis(10), 16)
            .expect("open logger")
    }

    async fn collect(mut watcher: LogWatcher) -> Vec<LogRecord> {
        let mut records = Vec::new();
        while let Some(item) = watcher.recv().await {
            records.push(item.expect("record"));
        }
        records
    }

    #[test]
    fn file_logger_writes_json_lines() {
        let dir = TempDir::new().expect("tempdir");
        let logger = logger_in(&dir);

        logger.write(&record_at("hello", "stdout", 0, false)).expect("write");
        logger.write(&record_at("frag", "stderr", 1, true)).expect("write");

        let content = std::fs::read_to_string(logger.path()).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["log"], "hello\n");
        assert_eq!(first["stream"], "stdout");
        assert!(first["time"].as_str().is_some_and(|t| t.ends_with(".123456789Z")));

        assert!(first.get("partial").is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("json");
        assert_eq!(second["log"], "frag");
        assert_eq!(second["partial"], true);
    }

    #[test]
    fn file_logger_rejects_writes_after_close() {
        let dir = TempDir::new().expect("tempdir");
        let logger = logger_in(&dir);
        logger.close().expect("close");
        assert!(matches!(
            logger.write(&record_at("late", "stdout", 0, false)),
            Err(LogDriverError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn file_logger_reads_back_history() {
        let dir = TempDir::new().expect("tempdir");
        let logger = logger_in(&dir);
        let written = vec![
            record_at("a", "stdout", 0, false),
            record_at("b", "stderr", 1, true),
            record_at("c", "stdout", 2, false),
        ];
        for r in &written {
            logger.write(r).expect("write");
        }

        let read = collect(logger.read_logs(&ReadConfig::new())).await;
        assert_eq!(read, written);
    }

    #[tokio::test]
    async fn file_logger_keeps_partial_fragment_ending_in_newline() {
        let dir = TempDir::new().expect("tempdir");
        let logger = logger_in(&dir);
        let fragment = record_at("split here\n", "stdout", 0, true);
        logger.write(&fragment).expect("write");

        let read = collect(logger.read_logs(&ReadConfig::new())).await;
        assert_eq!(read, vec![fragment]);
    }

    #[tokio::test]
    async fn file_logger_infers_partial_for_unmarked_lines() {
        let dir = TempDir::new().expect("tempdir");
        let logger = logger_in(&dir);
        {
            let mut file = OpenOptions::new().append(true).open(logger.path()).expect("open");
            file.write_all(
                b"{\"log\":\"whole\\n\",\"stream\":\"stdout\",\"time\":\"2024-01-01T00:00:00Z\"}\n\
                  {\"log\":\"frag\",\"stream\":\"stderr\",\"time\":\"2024-01-01T00:00:01Z\"}\n",
            )
            .expect("append");
        }

        let read = collect(logger.read_logs(&ReadConfig::new())).await;
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].line, b"whole");
        assert!(!read[0].partial);
        assert_eq!(read[1].line, b"frag");
        assert!(read[1].partial);
    }

    #[tokio::test]
    async fn file_logger_applies_tail_and_since() {
        let dir = TempDir::new().expect("tempdir");
        let logger = logger_in(&dir);
        for i in 0..5 {
            logger.write(&record_at(&format!("r{i}"), "stdout", i, false)).expect("write");
        }

        let tail = collect(logger.read_logs(&ReadConfig::new().with_tail(2))).await;
        let lines: Vec<String> = tail.iter().map(|r| r.line_lossy().into_owned()).collect();
        assert_eq!(lines, vec!["r3", "r4"]);

        let since = record_at("", "stdout", 3, false).timestamp();
        let recent = collect(logger.read_logs(&ReadConfig::new().with_since(since))).await;
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn file_logger_skips_corrupt_lines() {
        let dir = TempDir::new().expect("tempdir");
        let logger = logger_in(&dir);
        logger.write(&record_at("good", "stdout", 0, false)).expect("write");
        {
            let mut file = OpenOptions::new().append(true).open(logger.path()).expect("open");
            file.write_all(b"{not json}\n").expect("append");
        }
        logger.write(&record_at("also good", "stdout", 1, false)).expect("write");

        let read = collect(logger.read_logs(&ReadConfig::new())).await;
        assert_eq!(read.len(), 2);
    }

    #[tokio::test]
    async fn file_logger_follow_sees_new_writes_until_close() {
        let dir = TempDir::new().expect("tempdir");
        let logger = Arc::new(logger_in(&dir));
        logger.write(&record_at("before", "stdout", 0, false)).expect("write");

        let mut watcher = logger.read_logs(&ReadConfig::new().with_follow(true));
        let first = watcher.recv().await.expect("item").expect("record");
        assert_eq!(first.line, b"before");

        logger.write(&record_at("after", "stdout", 1, false)).expect("write");
        let second = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("follow timed out")
            .expect("item")
            .expect("record");
        assert_eq!(second.line, b"after");

        logger.close().expect("close");
        let end = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("follow did not end");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn file_logger_read_reports_missing_file() {
        let dir = TempDir::new().expect("tempdir");
        let logger = logger_in(&dir);
        std::fs::remove_file(logger.path()).expect("remove");

        let mut watcher = logger.read_logs(&ReadConfig::new());
        assert!(matches!(watcher.recv().await, Some(Err(LogDriverError::Io(_)))));
        assert!(watcher.recv().await.is_none());
    }

    #[test]
    fn factory_requires_resolved_path() {
        let factory = JsonFileStoreFactory::default();
        let err = factory
            .create(&StreamMetadata::new("c1"))
            .expect_err("no path");
        assert!(matches!(err, LogDriverError::InvalidPath { .. }));
    }

    #[test]
    fn factory_creates_read_capable_logger() {
        let dir = TempDir::new().expect("tempdir");
        let meta = StreamMetadata::new("c1").with_log_path(dir.path().join("app.log"));

        let logger = JsonFileStoreFactory::default().create(&meta).expect("create");
        assert!(logger.supports_read());
        assert!(dir.path().join("app.log").exists());
    }
}
