//! Length-delimited log entry codec.
//!
//! Frame format:
//! ```text
//! +---------------------------+-----------------------------+
//! | Length (4 bytes, BE u32)  | LogEntry (protobuf, Length) |
//! +---------------------------+-----------------------------+
//! ```
//!
//! The same framing is used for ingestion from the container supervisor and
//! for read-back responses.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{LogDriverError, Result};
use crate::types::LogRecord;

/// Maximum frame body accepted by default (1 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_000_000;

const LENGTH_PREFIX: usize = 4;

/// Wire representation of a log record.
#[derive(Clone, PartialEq, Message)]
pub struct LogEntry {
    /// Source tag (`stdout` / `stderr`).
    #[prost(string, tag = "1")]
    pub source: String,
    /// Timestamp in nanoseconds since the Unix epoch.
    #[prost(int64, tag = "2")]
    pub time_nano: i64,
    /// Raw payload.
    #[prost(bytes = "vec", tag = "3")]
    pub line: Vec<u8>,
    /// Fragment of a longer logical line.
    #[prost(bool, tag = "4")]
    pub partial: bool,
}

impl From<LogEntry> for LogRecord {
    fn from(entry: LogEntry) -> Self {
        Self {
            line: entry.line,
            source: entry.source,
            time_nano: entry.time_nano,
            partial: entry.partial,
        }
    }
}

impl From<LogRecord> for LogEntry {
    fn from(record: LogRecord) -> Self {
        Self {
            source: record.source,
            time_nano: record.time_nano,
            line: record.line,
            partial: record.partial,
        }
    }
}

/// Codec for length-prefixed [`LogEntry`] frames.
///
/// An oversized frame is reported once and its body is then skipped as it
/// arrives, so the decoder picks up again at the next frame boundary without
/// ever buffering the oversized body.
#[derive(Debug, Clone)]
pub struct LogEntryCodec {
    max_frame_size: usize,
    /// Bytes of an oversized frame still to be discarded.
    skipping: usize,
}

impl Default for LogEntryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LogEntryCodec {
    /// Creates a codec with the default frame limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a codec with a custom frame limit.
    #[must_use]
    pub const fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            skipping: 0,
        }
    }

    /// Returns the frame limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Returns true while the codec is discarding an oversized frame.
    #[must_use]
    pub const fn is_skipping(&self) -> bool {
        self.skipping > 0
    }

    fn discard(&mut self, src: &mut BytesMut) {
        let n = self.skipping.min(src.len());
        src.advance(n);
        self.skipping -= n;
    }
}

impl Decoder for LogEntryCodec {
    type Item = LogRecord;
    type Error = LogDriverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if self.skipping > 0 {
            self.discard(src);
            if self.skipping > 0 {
                return Ok(None);
            }
        }

        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = (&src[..LENGTH_PREFIX]).get_u32() as usize;

        if length > self.max_frame_size {
            src.advance(LENGTH_PREFIX);
            self.skipping = length;
            self.discard(src);
            return Err(LogDriverError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total_length = LENGTH_PREFIX + length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(length);
        let entry = LogEntry::decode(body.freeze())?;
        Ok(Some(entry.into()))
    }
}

impl Encoder<LogRecord> for LogEntryCodec {
    type Error = LogDriverError;

    fn encode(&mut self, item: LogRecord, dst: &mut BytesMut) -> Result<()> {
        let entry = LogEntry::from(item);
        let length = entry.encoded_len();

        if length > self.max_frame_size {
            return Err(LogDriverError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX + length);
        dst.put_u32(length as u32);
        entry.encode(dst)?;
        Ok(())
    }
}

/// Encodes a single record into a standalone frame.
///
/// # Errors
///
/// Returns an error if the record exceeds the default frame limit.
pub fn encode_frame(record: LogRecord) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    LogEntryCodec::new().encode(record, &mut buf)?;
    Ok(buf)
}
