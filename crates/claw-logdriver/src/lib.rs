//! # claw-logdriver
//!
//! Container logging driver core for Clawbernetes nodes.
//!
//! The container supervisor hands the driver one byte stream per container.
//! The driver decodes length-delimited log entries from it and forwards them
//! to a per-container storage engine, and serves read-back requests by
//! re-encoding stored records into the same frame format.
//!
//! This crate provides:
//!
//! - [`LogRouter`]: Start, stop, and read per-container log streams
//! - [`IngestionPipeline`]: Decode loop feeding one storage logger
//! - [`ReadBackMultiplexer`]: Stored records back out as a frame stream
//! - [`LogEntryCodec`]: Length-prefixed protobuf framing
//! - [`LogWriter`] / [`LogReader`]: Storage engine capabilities
//! - [`MemoryLogStore`]: In-memory engine with live tailing
//! - [`JsonFileLogger`]: JSON-lines file engine with follow support
//! - [`LabelPathPolicy`]: Label-driven log file layout
//!
//! ## Example
//!
//! ```rust,no_run
//! use claw_logdriver::{ContainerId, DriverConfig, LogRouter, ReadConfig, StreamHandle, StreamMetadata};
//!
//! # async fn run() -> claw_logdriver::Result<()> {
//! let router = LogRouter::json_file(DriverConfig::default());
//!
//! let metadata = StreamMetadata::new("c1").with_label("LogRootPath", "/var/log/apps");
//! router.start(StreamHandle::from("/run/docker/logging/c1"), metadata).await?;
//!
//! let _frames = router.read(&ContainerId::from("c1"), ReadConfig::new().with_tail(100))?;
//!
//! router.stop(&StreamHandle::from("/run/docker/logging/c1"))?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod error;
pub mod file_store;
pub mod input;
pub mod multiplexer;
pub mod path;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod store;
pub mod traits;
pub mod types;
pub mod watcher;

// Re-export main types
pub use codec::{DEFAULT_MAX_FRAME_SIZE, LogEntry, LogEntryCodec, encode_frame};
pub use config::DriverConfig;
pub use error::{LogDriverError, Result};
pub use file_store::{JsonFileLogger, JsonFileStoreFactory};
#[cfg(unix)]
pub use input::FifoOpener;
pub use input::{BoxFuture, InputOpener, InputStream};
pub use multiplexer::{LogReadStream, ReadBackMultiplexer};
pub use path::{LabelPathPolicy, LogPathPolicy};
pub use pipeline::{IngestionPipeline, IngestionStats, PipelineExit, PipelineTermination};
pub use registry::{PipelineId, StreamEntry, StreamRegistry};
pub use router::LogRouter;
pub use store::{MemoryLogStore, MemoryStoreFactory};
pub use traits::{LogReader, LogStoreFactory, LogWriter, StorageLogger};
pub use types::{ContainerId, LogRecord, ReadConfig, StreamHandle, StreamMetadata};
pub use watcher::{LogWatcher, WatcherSender};
