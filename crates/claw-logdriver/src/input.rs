//! Opening the per-container input byte stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
#[cfg(unix)]
use std::task::{Context, Poll, ready};
#[cfg(unix)]
use std::time::Duration;

use tokio::io::AsyncRead;
#[cfg(unix)]
use tokio::io::ReadBuf;
#[cfg(unix)]
use tokio::net::unix::pipe;
#[cfg(unix)]
use tokio::time::Sleep;

use crate::types::StreamHandle;

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A container's log output as seen by its ingestion pipeline.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens the input stream behind a stream handle.
pub trait InputOpener: Send + Sync {
    /// Opens the stream for reading.
    ///
    /// Must not wait for the writer side to appear.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    fn open<'a>(&'a self, handle: &'a StreamHandle) -> BoxFuture<'a, io::Result<InputStream>>;
}

/// How long a named pipe with no writer yet waits before reading again.
#[cfg(unix)]
const WRITER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Opens stream handles as named pipes.
///
/// The pipe is opened read-only without waiting for the supervisor to attach,
/// so a path that is missing or not a FIFO fails at once. End-of-stream is
/// reported once the writer that attached closes its end.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoOpener;

#[cfg(unix)]
impl InputOpener for FifoOpener {
    fn open<'a>(&'a self, handle: &'a StreamHandle) -> BoxFuture<'a, io::Result<InputStream>> {
        Box::pin(async move {
            let receiver = pipe::OpenOptions::new().open_receiver(handle.as_path())?;
            Ok(Box::new(FifoInput::new(receiver)) as InputStream)
        })
    }
}

/// Read side of a named pipe.
///
/// A read-only FIFO with no writer reads as empty. Until the first bytes
/// arrive, an empty read means the writer has not attached yet and the read
/// is retried after [`WRITER_POLL_INTERVAL`]; afterwards it is end-of-stream.
#[cfg(unix)]
struct FifoInput {
    receiver: pipe::Receiver,
    attached: bool,
    retry: Option<Pin<Box<Sleep>>>,
}

#[cfg(unix)]
impl FifoInput {
    fn new(receiver: pipe::Receiver) -> Self {
        Self {
            receiver,
            attached: false,
            retry: None,
        }
    }
}

#[cfg(unix)]
impl AsyncRead for FifoInput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let Some(retry) = this.retry.as_mut() {
                ready!(retry.as_mut().poll(cx));
                this.retry = None;
            }

            let before = buf.filled().len();
            ready!(Pin::new(&mut this.receiver).poll_read(cx, buf))?;
            if this.attached || buf.filled().len() > before {
                this.attached = true;
                return Poll::Ready(Ok(()));
            }

            this.retry = Some(Box::pin(tokio::time::sleep(WRITER_POLL_INTERVAL)));
        }
    }
}
