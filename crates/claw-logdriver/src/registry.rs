//! Registry of active log streams.
//!
//! Streams are indexed twice: by handle, which stop calls address, and by
//! container, which read calls address. Both maps sit behind one lock that is
//! only held for map access.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{LogDriverError, Result};
use crate::pipeline::PipelineTermination;
use crate::traits::StorageLogger;
use crate::types::{ContainerId, StreamHandle, StreamMetadata};

/// Unique id assigned to each pipeline at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u64);

/// Shared view of an active pipeline.
///
/// The pipeline task owns its input stream and decoder; the registry only
/// keeps what stop and read calls need.
#[derive(Debug)]
pub struct StreamEntry {
    id: PipelineId,
    handle: StreamHandle,
    metadata: Arc<StreamMetadata>,
    logger: StorageLogger,
    cancel: CancellationToken,
    termination: PipelineTermination,
}

impl StreamEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(
        id: PipelineId,
        handle: StreamHandle,
        metadata: Arc<StreamMetadata>,
        logger: StorageLogger,
        cancel: CancellationToken,
        termination: PipelineTermination,
    ) -> Self {
        Self {
            id,
            handle,
            metadata,
            logger,
            cancel,
            termination,
        }
    }

    /// Returns the pipeline id.
    #[must_use]
    pub const fn id(&self) -> PipelineId {
        self.id
    }

    /// Returns the stream handle.
    #[must_use]
    pub const fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Returns the owning container.
    #[must_use]
    pub fn container_id(&self) -> &ContainerId {
        &self.metadata.container_id
    }

    /// Returns the metadata the stream was started with.
    #[must_use]
    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    /// Returns the storage logger.
    #[must_use]
    pub const fn logger(&self) -> &StorageLogger {
        &self.logger
    }

    /// Returns a termination signal for the pipeline.
    #[must_use]
    pub fn termination(&self) -> PipelineTermination {
        self.termination.clone()
    }

    /// Signals the pipeline to stop. The pipeline drops its input stream at
    /// the next loop boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
struct Maps {
    by_handle: HashMap<StreamHandle, Arc<StreamEntry>>,
    by_container: HashMap<ContainerId, Arc<StreamEntry>>,
}

/// Concurrent registry of active streams.
#[derive(Debug)]
pub struct StreamRegistry {
    maps: Mutex<Maps>,
    next_id: AtomicU64,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates an id for a pipeline about to be registered.
    pub fn next_id(&self) -> PipelineId {
        PipelineId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns true if the handle has an active stream.
    #[must_use]
    pub fn contains(&self, handle: &StreamHandle) -> bool {
        self.maps.lock().by_handle.contains_key(handle)
    }

    /// Registers a stream under its handle and its container.
    ///
    /// # Errors
    ///
    /// Returns [`LogDriverError::AlreadyActive`] if the handle is taken, or
    /// [`LogDriverError::ContainerActive`] if the container already streams
    /// under another handle. Nothing is inserted on error.
    pub fn insert(&self, entry: Arc<StreamEntry>) -> Result<()> {
        let mut maps = self.maps.lock();

        if maps.by_handle.contains_key(entry.handle()) {
            return Err(LogDriverError::AlreadyActive(entry.handle().to_string()));
        }
        if maps.by_container.contains_key(entry.container_id()) {
            return Err(LogDriverError::ContainerActive(entry.container_id().to_string()));
        }

        maps.by_container
            .insert(entry.container_id().clone(), Arc::clone(&entry));
        maps.by_handle.insert(entry.handle().clone(), entry);
        Ok(())
    }

    /// Removes the stream registered under `handle` from both maps.
    pub fn remove(&self, handle: &StreamHandle) -> Option<Arc<StreamEntry>> {
        let mut maps = self.maps.lock();
        let entry = maps.by_handle.remove(handle)?;
        Self::unindex_container(&mut maps, &entry);
        Some(entry)
    }

    /// Removes the stream under `handle` only if it is still pipeline `id`.
    ///
    /// Used by pipelines deregistering themselves after end-of-stream, so a
    /// newer pipeline started on the same handle is left alone.
    pub fn remove_if_current(&self, handle: &StreamHandle, id: PipelineId) -> bool {
        let mut maps = self.maps.lock();
        if maps.by_handle.get(handle).is_none_or(|entry| entry.id() != id) {
            return false;
        }
        if let Some(entry) = maps.by_handle.remove(handle) {
            Self::unindex_container(&mut maps, &entry);
        }
        true
    }

    /// Looks up a stream by handle.
    #[must_use]
    pub fn get(&self, handle: &StreamHandle) -> Option<Arc<StreamEntry>> {
        self.maps.lock().by_handle.get(handle).cloned()
    }

    /// Looks up a stream by container.
    #[must_use]
    pub fn get_by_container(&self, container_id: &ContainerId) -> Option<Arc<StreamEntry>> {
        self.maps.lock().by_container.get(container_id).cloned()
    }

    /// Removes and returns every stream.
    pub fn drain(&self) -> Vec<Arc<StreamEntry>> {
        let mut maps = self.maps.lock();
        maps.by_container.clear();
        maps.by_handle.drain().map(|(_, entry)| entry).collect()
    }

    /// Returns the number of active streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.lock().by_handle.len()
    }

    /// Returns true if no stream is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.lock().by_handle.is_empty()
    }

    fn unindex_container(maps: &mut Maps, entry: &StreamEntry) {
        if maps
            .by_container
            .get(entry.container_id())
            .is_some_and(|indexed| indexed.id() == entry.id())
        {
            maps.by_container.remove(entry.container_id());
        }
    }
}
