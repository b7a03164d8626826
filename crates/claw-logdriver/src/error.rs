//! Error types for the logging driver.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while routing container logs.
#[derive(Debug, Error)]
pub enum LogDriverError {
    /// A log stream is already active for the handle.
    #[error("logger for {0:?} already exists")]
    AlreadyActive(String),

    /// The container already has an active log stream under another handle.
    #[error("container {0} already has an active log stream")]
    ContainerActive(String),

    /// No log stream is registered for the container.
    #[error("logger does not exist for {0}")]
    NotFound(String),

    /// The storage logger backing the container cannot serve reads.
    #[error("logger for {0} does not support reading")]
    Unsupported(String),

    /// The resolved or supplied log path is unusable.
    #[error("invalid log path {}: {reason}", path.display())]
    InvalidPath {
        /// The offending path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// Setting up on-disk state for a stream failed.
    #[error("{context}: {source}")]
    Setup {
        /// What was being set up.
        context: String,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A frame announced a body larger than the decoder accepts.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Announced body size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame body could not be decoded as a log entry.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] prost::DecodeError),

    /// A log entry could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid driver configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The log stream was closed.
    #[error("log stream closed")]
    StreamClosed,
}

impl LogDriverError {
    /// Wraps an I/O error with a description of the setup step that failed.
    pub fn setup(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Setup {
            context: context.into(),
            source,
        }
    }

    /// Returns true for errors the ingestion loop recovers from locally.
    #[must_use]
    pub const fn is_frame_error(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::MalformedFrame(_))
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, LogDriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = LogDriverError::AlreadyActive("/run/c1.fifo".to_string());
        assert_eq!(err.to_string(), "logger for \"/run/c1.fifo\" already exists");

        let err = LogDriverError::NotFound("c1".to_string());
        assert_eq!(err.to_string(), "logger does not exist for c1");

        let err = LogDriverError::Unsupported("c1".to_string());
        assert_eq!(err.to_string(), "logger for c1 does not support reading");

        let err = LogDriverError::StreamClosed;
        assert_eq!(err.to_string(), "log stream closed");
    }

    #[test]
    fn error_frame_too_large_display() {
        let err = LogDriverError::FrameTooLarge {
            size: 2_000_000,
            max: 1_000_000,
        };
        assert_eq!(
            err.to_string(),
            "frame of 2000000 bytes exceeds maximum of 1000000 bytes"
        );
        assert!(err.is_frame_error());
    }

    #[test]
    fn error_invalid_path_display() {
        let err = LogDriverError::InvalidPath {
            path: PathBuf::from("/mnt/missing"),
            reason: "not a directory".to_string(),
        };
        assert_eq!(err.to_string(), "invalid log path /mnt/missing: not a directory");
        assert!(!err.is_frame_error());
    }

    #[test]
    fn error_setup_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = LogDriverError::setup("error setting up logger dir", io_err);
        assert_eq!(err.to_string(), "error setting up logger dir: denied");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn error_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "fifo not found");
        let err: LogDriverError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LogDriverError>();
    }
}
