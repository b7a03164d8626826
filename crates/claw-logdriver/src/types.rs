//! Core types for log routing.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identifies one logging session, usually the path of the container's log FIFO.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamHandle(String);

impl StreamHandle {
    /// Creates a handle from any string-like value.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Returns the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the handle interpreted as a filesystem path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamHandle {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StreamHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Stable identifier of the container that owns a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContainerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Attributes describing the container behind a stream.
///
/// Field names follow the JSON the container supervisor sends with a
/// start-logging call, so a transport can deserialize it directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamMetadata {
    /// Owning container.
    #[serde(rename = "ContainerID")]
    pub container_id: ContainerId,
    /// Human-readable container name.
    #[serde(default)]
    pub container_name: String,
    /// Container labels.
    #[serde(default, rename = "ContainerLabels")]
    pub labels: HashMap<String, String>,
    /// Logging options configured for the container.
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Storage path resolved at start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl StreamMetadata {
    /// Creates metadata for a container with no labels or options.
    #[must_use]
    pub fn new(container_id: impl Into<ContainerId>) -> Self {
        Self {
            container_id: container_id.into(),
            ..Default::default()
        }
    }

    /// Sets the container name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = name.into();
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds a logging option.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Sets the resolved storage path.
    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Looks up a label value.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// A single log record as carried on the wire and handed to storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogRecord {
    /// Raw payload bytes.
    pub line: Vec<u8>,
    /// Source tag, e.g. `stdout` or `stderr`.
    pub source: String,
    /// Timestamp in nanoseconds since the Unix epoch.
    pub time_nano: i64,
    /// Whether this payload is a fragment of a longer logical line.
    pub partial: bool,
}

impl LogRecord {
    /// Creates a complete (non-partial) record.
    #[must_use]
    pub fn new(line: impl Into<Vec<u8>>, source: impl Into<String>, time_nano: i64) -> Self {
        Self {
            line: line.into(),
            source: source.into(),
            time_nano,
            partial: false,
        }
    }

    /// Creates a record stamped with a wall-clock time.
    #[must_use]
    pub fn at(line: impl Into<Vec<u8>>, source: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::new(line, source, time.timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    /// Marks the record as partial.
    #[must_use]
    pub const fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// Returns the record timestamp.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.time_nano)
    }

    /// Returns the payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn line_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.line)
    }
}

/// Options for reading logs back.
///
/// Storage engines interpret these; the router passes them through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReadConfig {
    /// Only return records at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only return records at or before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Only return the last N historical records. `None` returns everything.
    #[serde(deserialize_with = "deserialize_tail")]
    pub tail: Option<usize>,
    /// Keep streaming newly written records after history is exhausted.
    pub follow: bool,
}

impl ReadConfig {
    /// Creates a config that returns full history and stops.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lower time bound.
    #[must_use]
    pub const fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the upper time bound.
    #[must_use]
    pub const fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Limits history to the last `lines` records.
    #[must_use]
    pub const fn with_tail(mut self, lines: usize) -> Self {
        self.tail = Some(lines);
        self
    }

    /// Enables live tailing.
    #[must_use]
    pub const fn with_follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    /// Returns true if the timestamp falls inside the since/until window.
    #[must_use]
    pub fn in_window(&self, timestamp: DateTime<Utc>) -> bool {
        self.since.is_none_or(|since| timestamp >= since)
            && self.until.is_none_or(|until| timestamp <= until)
    }

    /// Returns true if the timestamp is past the upper bound.
    #[must_use]
    pub fn is_past_until(&self, timestamp: DateTime<Utc>) -> bool {
        self.until.is_some_and(|until| timestamp > until)
    }
}

// Supervisors send `-1` for "all lines".
fn deserialize_tail<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.and_then(|n| usize::try_from(n).ok()))
}
