//! Traits for log storage backends.
//!
//! Storage engines come in two capabilities: write-only loggers implement
//! [`LogWriter`], engines that can also serve reads implement [`LogReader`].
//! [`StorageLogger`] carries whichever capability the engine offers so the
//! router can tell them apart at read time.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{LogRecord, ReadConfig, StreamMetadata};
use crate::watcher::LogWatcher;

/// A storage logger that persists records.
pub trait LogWriter: Send + Sync {
    /// Persists a single record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be stored.
    fn write(&self, record: &LogRecord) -> Result<()>;

    /// Flushes and releases the logger. Further writes may fail.
    ///
    /// # Errors
    ///
    /// Returns an error if pending data could not be flushed.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A storage logger that can also stream stored records back.
pub trait LogReader: LogWriter {
    /// Opens a live read handle.
    ///
    /// The watcher yields stored records matching `config`, then, if
    /// `config.follow` is set, newly written records until it is dropped.
    /// Must be called from within a tokio runtime.
    fn read_logs(&self, config: &ReadConfig) -> LogWatcher;
}

/// A storage logger together with its capability.
#[derive(Clone)]
pub enum StorageLogger {
    /// The engine can only persist records.
    WriteOnly(Arc<dyn LogWriter>),
    /// The engine can persist and read back records.
    ReadCapable(Arc<dyn LogReader>),
}

impl StorageLogger {
    /// Wraps a write-only engine.
    pub fn write_only(writer: impl LogWriter + 'static) -> Self {
        Self::WriteOnly(Arc::new(writer))
    }

    /// Wraps a read-capable engine.
    pub fn read_capable(reader: impl LogReader + 'static) -> Self {
        Self::ReadCapable(Arc::new(reader))
    }

    /// Persists a record through whichever engine is wrapped.
    ///
    /// # Errors
    ///
    /// Returns the engine's write error.
    pub fn write(&self, record: &LogRecord) -> Result<()> {
        match self {
            Self::WriteOnly(writer) => writer.write(record),
            Self::ReadCapable(reader) => reader.write(record),
        }
    }

    /// Closes the wrapped engine.
    ///
    /// # Errors
    ///
    /// Returns the engine's close error.
    pub fn close(&self) -> Result<()> {
        match self {
            Self::WriteOnly(writer) => writer.close(),
            Self::ReadCapable(reader) => reader.close(),
        }
    }

    /// Returns the read capability, if the engine has one.
    #[must_use]
    pub fn reader(&self) -> Option<&Arc<dyn LogReader>> {
        match self {
            Self::WriteOnly(_) => None,
            Self::ReadCapable(reader) => Some(reader),
        }
    }

    /// Returns true if the engine can serve reads.
    #[must_use]
    pub const fn supports_read(&self) -> bool {
        matches!(self, Self::ReadCapable(_))
    }
}

impl fmt::Debug for StorageLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteOnly(_) => f.write_str("StorageLogger::WriteOnly"),
            Self::ReadCapable(_) => f.write_str("StorageLogger::ReadCapable"),
        }
    }
}

/// Creates a storage logger for a newly started stream.
pub trait LogStoreFactory: Send + Sync {
    /// Creates the logger for a stream.
    ///
    /// `metadata.log_path` holds the path resolved for the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be initialised.
    fn create(&self, metadata: &StreamMetadata) -> Result<StorageLogger>;
}

impl<F> LogStoreFactory for F
where
    F: Fn(&StreamMetadata) -> Result<StorageLogger> + Send + Sync,
{
    fn create(&self, metadata: &StreamMetadata) -> Result<StorageLogger> {
        self(metadata)
    }
}
