//! Live read handles handed out by storage engines.
//!
//! A [`LogWatcher`] yields historical records followed by newly written ones,
//! in storage order, until the engine has nothing more to send or reports an
//! error. Dropping the watcher releases the engine side: the paired
//! [`WatcherSender`] observes the closure and stops producing.

use tokio::sync::mpsc;

use crate::error::{LogDriverError, Result};
use crate::types::LogRecord;

/// Default number of records buffered between a storage engine and a reader.
pub const DEFAULT_WATCHER_BUFFER: usize = 256;

/// Consumer half of a live read handle.
#[derive(Debug)]
pub struct LogWatcher {
    receiver: mpsc::Receiver<Result<LogRecord>>,
}

/// Producer half of a live read handle, owned by the storage engine.
#[derive(Debug, Clone)]
pub struct WatcherSender {
    sender: mpsc::Sender<Result<LogRecord>>,
}

impl LogWatcher {
    /// Creates a connected watcher pair.
    #[must_use]
    pub fn channel(buffer: usize) -> (WatcherSender, Self) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (WatcherSender { sender }, Self { receiver })
    }

    /// Receives the next record.
    ///
    /// Returns `None` once the engine has finished. An `Err` item is the last
    /// item the engine sends.
    pub async fn recv(&mut self) -> Option<Result<LogRecord>> {
        self.receiver.recv().await
    }

    /// Closes the watcher, telling the engine to stop producing.
    ///
    /// Records already buffered can still be received.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl WatcherSender {
    /// Sends a record to the reader.
    ///
    /// # Errors
    ///
    /// Returns [`LogDriverError::StreamClosed`] if the reader went away.
    pub async fn send(&self, record: LogRecord) -> Result<()> {
        self.sender
            .send(Ok(record))
            .await
            .map_err(|_| LogDriverError::StreamClosed)
    }

    /// Reports a terminal error to the reader and finishes the watcher.
    pub async fn fail(self, error: LogDriverError) {
        let _ = self.sender.send(Err(error)).await;
    }

    /// Returns true once the reader dropped or closed its watcher.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Completes when the reader drops or closes its watcher.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }
}
