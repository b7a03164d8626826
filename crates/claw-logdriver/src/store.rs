//! In-memory log storage with live tailing.
//!
//! This module provides:
//! - [`MemoryLogStore`]: bounded, read-capable storage for one container
//! - [`MemoryStoreFactory`]: creates one store per container and keeps them
//!   reachable for inspection

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::DriverConfig;
use crate::error::{LogDriverError, Result};
use crate::traits::{LogReader, LogStoreFactory, LogWriter, StorageLogger};
use crate::types::{ContainerId, LogRecord, ReadConfig, StreamMetadata};
use crate::watcher::{DEFAULT_WATCHER_BUFFER, LogWatcher, WatcherSender};

struct Inner {
    records: VecDeque<LogRecord>,
    /// `None` once the store is closed.
    live: Option<broadcast::Sender<LogRecord>>,
}

/// Thread-safe in-memory log store.
///
/// Keeps at most `capacity` records, dropping the oldest first.
pub struct MemoryLogStore {
    capacity: usize,
    buffer: usize,
    inner: RwLock<Inner>,
}

impl MemoryLogStore {
    /// Creates a store holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_buffer(capacity, DEFAULT_WATCHER_BUFFER)
    }

    /// Creates a store with a custom live-tail buffer size.
    #[must_use]
    pub fn with_buffer(capacity: usize, buffer: usize) -> Self {
        let buffer = buffer.max(1);
        let (live, _) = broadcast::channel(buffer);
        Self {
            capacity: capacity.max(1),
            buffer,
            inner: RwLock::new(Inner {
                records: VecDeque::new(),
                live: Some(live),
            }),
        }
    }

    /// Returns a snapshot of the stored records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.inner.read().records.iter().cloned().collect()
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// Returns true once the store stopped accepting records.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.read().live.is_none()
    }

    /// Returns the record capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl LogWriter for MemoryLogStore {
    fn write(&self, record: &LogRecord) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(live) = inner.live.clone() else {
            return Err(LogDriverError::StreamClosed);
        };

        inner.records.push_back(record.clone());
        while inner.records.len() > self.capacity {
            inner.records.pop_front();
        }

        // No followers is fine.
        let _ = live.send(record.clone());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.inner.write().live = None;
        Ok(())
    }
}

impl LogReader for MemoryLogStore {
    fn read_logs(&self, config: &ReadConfig) -> LogWatcher {
        let (sender, watcher) = LogWatcher::channel(self.buffer);

        // Snapshot and subscribe under one lock so no record is missed or
        // delivered twice at the history/live boundary.
        let (history, live) = {
            let inner = self.inner.read();
            let live = if config.follow {
                inner.live.as_ref().map(broadcast::Sender::subscribe)
            } else {
                None
            };
            (select_history(&inner.records, config), live)
        };

        tokio::spawn(stream_records(history, live, config.clone(), sender));
        watcher
    }
}

fn select_history(records: &VecDeque<LogRecord>, config: &ReadConfig) -> Vec<LogRecord> {
    let mut selected: Vec<LogRecord> = records
        .iter()
        .filter(|r| config.in_window(r.timestamp()))
        .cloned()
        .collect();

    if let Some(tail) = config.tail {
        let skip = selected.len().saturating_sub(tail);
        selected.drain(..skip);
    }
    selected
}

async fn stream_records(
    history: Vec<LogRecord>,
    live: Option<broadcast::Receiver<LogRecord>>,
    config: ReadConfig,
    sender: WatcherSender,
) {
    for record in history {
        if sender.send(record).await.is_err() {
            return;
        }
    }

    let Some(mut live) = live else {
        return;
    };

    loop {
        tokio::select! {
            () = sender.closed() => return,
            received = live.recv() => match received {
                Ok(record) => {
                    let timestamp = record.timestamp();
                    if config.is_past_until(timestamp) {
                        return;
                    }
                    if !config.in_window(timestamp) {
                        continue;
                    }
                    if sender.send(record).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "log reader fell behind, records skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

/// Factory creating one [`MemoryLogStore`] per container.
pub struct MemoryStoreFactory {
    capacity: usize,
    stores: Mutex<HashMap<ContainerId, Arc<MemoryLogStore>>>,
}

impl MemoryStoreFactory {
    /// Creates a factory whose stores hold at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a factory sized by `memory_store_capacity`.
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.memory_store_capacity)
    }

    /// Returns the most recent store created for a container.
    #[must_use]
    pub fn store(&self, container_id: &ContainerId) -> Option<Arc<MemoryLogStore>> {
        self.stores.lock().get(container_id).cloned()
    }
}

impl LogStoreFactory for MemoryStoreFactory {
    fn create(&self, metadata: &StreamMetadata) -> Result<StorageLogger> {
        let store = Arc::new(MemoryLogStore::new(self.capacity));
        self.stores
            .lock()
            .insert(metadata.container_id.clone(), Arc::clone(&store));
        Ok(StorageLogger::ReadCapable(store))
    }
}
