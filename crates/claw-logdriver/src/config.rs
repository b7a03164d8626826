//! Driver configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{LogDriverError, Result};
use crate::watcher::DEFAULT_WATCHER_BUFFER;

/// Configuration for the log router and its bundled storage engines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Root directory used when a container carries no `LogRootPath` label.
    pub log_root: PathBuf,
    /// File name of the per-container log file.
    pub log_file_name: String,
    /// Largest frame body accepted on ingestion and produced on read-back.
    pub max_frame_size: usize,
    /// Consecutive decode errors tolerated before ingestion backs off.
    pub decode_error_threshold: u32,
    /// Pause applied once the decode error threshold is reached (milliseconds).
    pub decode_error_backoff_ms: u64,
    /// Frames buffered between a storage reader and a read-back consumer.
    pub read_buffer: usize,
    /// How often a following file reader checks for new records (milliseconds).
    pub follow_poll_interval_ms: u64,
    /// Records kept per container by the in-memory engine.
    pub memory_store_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("/mnt/logs"),
            log_file_name: "application.log".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            decode_error_threshold: 16,
            decode_error_backoff_ms: 100,
            read_buffer: DEFAULT_WATCHER_BUFFER,
            follow_poll_interval_ms: 250,
            memory_store_capacity: 100_000,
        }
    }
}

impl DriverConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LogDriverError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parses configuration from a JSON string. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or the values fail validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| LogDriverError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.log_root.as_os_str().is_empty() {
            return Err(LogDriverError::Config("log_root cannot be empty".to_string()));
        }

        if self.log_file_name.is_empty()
            || self.log_file_name.contains(std::path::MAIN_SEPARATOR)
            || self.log_file_name.contains('/')
        {
            return Err(LogDriverError::Config(format!(
                "log_file_name must be a plain file name, got '{}'",
                self.log_file_name
            )));
        }

        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(LogDriverError::Config(format!(
                "max_frame_size must be between 1 and {}",
                u32::MAX
            )));
        }

        if self.decode_error_threshold == 0 {
            return Err(LogDriverError::Config(
                "decode_error_threshold must be at least 1".to_string(),
            ));
        }

        if self.read_buffer == 0 {
            return Err(LogDriverError::Config("read_buffer must be at least 1".to_string()));
        }

        if self.follow_poll_interval_ms == 0 {
            return Err(LogDriverError::Config(
                "follow_poll_interval_ms must be at least 1".to_string(),
            ));
        }

        if self.memory_store_capacity == 0 {
            return Err(LogDriverError::Config(
                "memory_store_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the default log root.
    #[must_use]
    pub fn with_log_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.log_root = root.into();
        self
    }

    /// Sets the maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the decode error threshold and backoff.
    #[must_use]
    pub const fn with_decode_backoff(mut self, threshold: u32, backoff: Duration) -> Self {
        self.decode_error_threshold = threshold;
        self.decode_error_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Sets the follow poll interval.
    #[must_use]
    pub const fn with_follow_poll_interval(mut self, interval: Duration) -> Self {
        self.follow_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Returns the decode error backoff.
    #[must_use]
    pub const fn decode_error_backoff(&self) -> Duration {
        Duration::from_millis(self.decode_error_backoff_ms)
    }

    /// Returns the follow poll interval.
    #[must_use]
    pub const fn follow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.follow_poll_interval_ms)
    }
}
