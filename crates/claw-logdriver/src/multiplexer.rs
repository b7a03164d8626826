//! Read-back multiplexing.
//!
//! Turns a storage engine's [`LogWatcher`] into a byte stream of
//! length-delimited frames, the same wire format the ingestion side consumes.
//! A background task pumps records from the watcher into the stream; the
//! caller only ever sees bytes.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::codec::LogEntryCodec;
use crate::traits::LogReader;
use crate::types::ReadConfig;
use crate::watcher::{DEFAULT_WATCHER_BUFFER, LogWatcher};

/// Byte stream of encoded frames returned by a read.
///
/// Yields frames in storage order and reaches end-of-stream once the engine
/// has nothing more to send. An engine error surfaces as an I/O error on the
/// next read. Dropping the stream closes the underlying watcher.
pub struct LogReadStream {
    inner: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
}

impl std::fmt::Debug for LogReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReadStream").finish_non_exhaustive()
    }
}

impl AsyncRead for LogReadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Pumps one watcher into one [`LogReadStream`].
pub struct ReadBackMultiplexer {
    reader: Arc<dyn LogReader>,
    config: ReadConfig,
    buffer: usize,
    max_frame_size: usize,
}

impl ReadBackMultiplexer {
    /// Creates a multiplexer over a read-capable engine.
    #[must_use]
    pub fn new(reader: Arc<dyn LogReader>, config: ReadConfig) -> Self {
        Self {
            reader,
            config,
            buffer: DEFAULT_WATCHER_BUFFER,
            max_frame_size: LogEntryCodec::new().max_frame_size(),
        }
    }

    /// Sets the number of frames buffered ahead of the consumer.
    #[must_use]
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Sets the largest frame body the stream will carry.
    #[must_use]
    pub const fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Opens the engine's watcher and starts pumping it.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(self) -> LogReadStream {
        let watcher = self.reader.read_logs(&self.config);
        let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(self.buffer);

        tokio::spawn(pump(
            watcher,
            tx,
            LogEntryCodec::with_max_frame_size(self.max_frame_size),
        ));

        let frames = stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();
        LogReadStream {
            inner: StreamReader::new(frames),
        }
    }
}

async fn pump(mut watcher: LogWatcher, tx: mpsc::Sender<io::Result<Bytes>>, mut codec: LogEntryCodec) {
    loop {
        let item = tokio::select! {
            biased;
            () = tx.closed() => {
                debug!("log reader went away, closing watcher");
                break;
            }
            item = watcher.recv() => item,
        };

        let Some(item) = item else {
            break;
        };

        let record = match item {
            Ok(record) => record,
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e))).await;
                break;
            }
        };

        let mut frame = BytesMut::new();
        match codec.encode(record, &mut frame) {
            Ok(()) => {
                if tx.send(Ok(frame.freeze())).await.is_err() {
                    break;
                }
            }
            Err(e) if e.is_frame_error() => {
                warn!(error = %e, "skipping stored record that cannot be framed");
            }
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e))).await;
                break;
            }
        }
    }
    watcher.close();
}
