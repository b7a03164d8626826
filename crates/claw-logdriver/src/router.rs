//! The log router: lifecycle of per-container ingestion pipelines.
//!
//! [`LogRouter`] is the entry point the container supervisor talks to. It
//! starts a pipeline per stream handle, stops it again, and serves read-back
//! requests by container id. All calls may be made concurrently.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::{LogDriverError, Result};
use crate::input::InputOpener;
use crate::multiplexer::{LogReadStream, ReadBackMultiplexer};
use crate::path::LogPathPolicy;
use crate::pipeline::{IngestionPipeline, PipelineExit, PipelineTermination, termination_channel};
use crate::registry::{StreamEntry, StreamRegistry};
use crate::traits::{LogStoreFactory, StorageLogger};
use crate::types::{ContainerId, ReadConfig, StreamHandle, StreamMetadata};

/// Routes container log streams into storage and back out.
pub struct LogRouter {
    registry: Arc<StreamRegistry>,
    stores: Arc<dyn LogStoreFactory>,
    paths: Arc<dyn LogPathPolicy>,
    inputs: Arc<dyn InputOpener>,
    config: DriverConfig,
}

impl std::fmt::Debug for LogRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRouter")
            .field("active_streams", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LogRouter {
    /// Creates a router from its collaborators.
    #[must_use]
    pub fn new(
        config: DriverConfig,
        stores: Arc<dyn LogStoreFactory>,
        paths: Arc<dyn LogPathPolicy>,
        inputs: Arc<dyn InputOpener>,
    ) -> Self {
        Self {
            registry: Arc::new(StreamRegistry::new()),
            stores,
            paths,
            inputs,
            config,
        }
    }

    /// Creates a router reading named pipes into JSON log files laid out by
    /// container labels.
    #[cfg(unix)]
    #[must_use]
    pub fn json_file(config: DriverConfig) -> Self {
        let stores = Arc::new(crate::file_store::JsonFileStoreFactory::from_config(&config));
        let paths = Arc::new(crate::path::LabelPathPolicy::from_config(&config));
        Self::new(config, stores, paths, Arc::new(crate::input::FifoOpener))
    }

    /// Returns the router configuration.
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Returns the registry of active streams.
    #[must_use]
    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Starts ingesting the stream behind `handle`.
    ///
    /// Resolves the log path, creates the storage logger, opens the input
    /// stream, registers the pipeline, and spawns it. Returns the pipeline's
    /// termination signal. On error nothing stays registered and no task is
    /// spawned.
    ///
    /// # Errors
    ///
    /// Returns [`LogDriverError::AlreadyActive`] if the handle already has a
    /// pipeline, [`LogDriverError::ContainerActive`] if the container streams
    /// under another handle, or the path, storage, or input setup error.
    pub async fn start(
        &self,
        handle: StreamHandle,
        metadata: StreamMetadata,
    ) -> Result<PipelineTermination> {
        if self.registry.contains(&handle) {
            return Err(LogDriverError::AlreadyActive(handle.to_string()));
        }

        let (metadata, logger) = self.prepare_storage(metadata).await?;

        let input = match self.inputs.open(&handle).await {
            Ok(input) => input,
            Err(e) => {
                if let Err(close_err) = logger.close() {
                    debug!(error = %close_err, "error closing unused storage logger");
                }
                return Err(LogDriverError::setup(format!("error opening log stream {handle}"), e));
            }
        };

        let id = self.registry.next_id();
        let cancel = CancellationToken::new();
        let (publisher, termination) = termination_channel();
        let entry = Arc::new(StreamEntry::new(
            id,
            handle.clone(),
            Arc::clone(&metadata),
            logger.clone(),
            cancel.clone(),
            termination.clone(),
        ));

        if let Err(e) = self.registry.insert(entry) {
            if let Err(close_err) = logger.close() {
                debug!(error = %close_err, "error closing unused storage logger");
            }
            return Err(e);
        }

        let pipeline = IngestionPipeline::new(
            handle.clone(),
            metadata.container_id.clone(),
            input,
            logger,
            cancel,
            &self.config,
        );

        let registry = Arc::clone(&self.registry);
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let exit = match tokio::spawn(pipeline.run()).await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(handle = %task_handle, error = %e, "ingestion task failed");
                    PipelineExit::Aborted
                }
            };
            if registry.remove_if_current(&task_handle, id) {
                debug!(handle = %task_handle, ?exit, "pipeline deregistered itself");
            }
            publisher.publish(exit);
        });

        info!(
            handle = %handle,
            container_id = %metadata.container_id,
            container_name = %metadata.container_name,
            path = ?metadata.log_path,
            "log stream started"
        );
        Ok(termination)
    }

    /// Resolves the log path and creates the storage logger on the blocking
    /// pool; both touch the filesystem.
    async fn prepare_storage(
        &self,
        metadata: StreamMetadata,
    ) -> Result<(Arc<StreamMetadata>, StorageLogger)> {
        let paths = Arc::clone(&self.paths);
        let stores = Arc::clone(&self.stores);

        tokio::task::spawn_blocking(move || -> Result<(Arc<StreamMetadata>, StorageLogger)> {
            let log_path = paths.resolve(&metadata)?;
            let metadata = Arc::new(metadata.with_log_path(log_path));
            let logger = stores.create(&metadata)?;
            Ok((metadata, logger))
        })
        .await
        .map_err(|e| LogDriverError::setup("logger setup task failed", std::io::Error::other(e)))?
    }

    /// Stops the pipeline behind `handle`.
    ///
    /// The pipeline is deregistered at once and drops its input stream at its
    /// next loop boundary; this call does not wait for it. Stopping an
    /// unknown handle is not an error.
    ///
    /// # Errors
    ///
    /// This call does not currently fail.
    pub fn stop(&self, handle: &StreamHandle) -> Result<()> {
        let Some(entry) = self.registry.remove(handle) else {
            warn!(handle = %handle, "stop requested for unknown log stream");
            return Ok(());
        };

        entry.cancel();
        info!(
            handle = %handle,
            container_id = %entry.container_id(),
            "log stream stop requested"
        );
        Ok(())
    }

    /// Opens a read-back stream over a container's stored logs.
    ///
    /// Returns immediately; frames are produced by a background task. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LogDriverError::NotFound`] if the container has no active
    /// pipeline, or [`LogDriverError::Unsupported`] if its storage engine
    /// cannot serve reads.
    pub fn read(&self, container_id: &ContainerId, config: ReadConfig) -> Result<LogReadStream> {
        let entry = self
            .registry
            .get_by_container(container_id)
            .ok_or_else(|| LogDriverError::NotFound(container_id.to_string()))?;

        let reader = entry
            .logger()
            .reader()
            .cloned()
            .ok_or_else(|| LogDriverError::Unsupported(container_id.to_string()))?;

        debug!(container_id = %container_id, ?config, "opening log read-back");
        Ok(ReadBackMultiplexer::new(reader, config)
            .with_buffer(self.config.read_buffer)
            .with_max_frame_size(self.config.max_frame_size)
            .spawn())
    }

    /// Returns the termination signal of the pipeline behind `handle`.
    #[must_use]
    pub fn termination(&self, handle: &StreamHandle) -> Option<PipelineTermination> {
        self.registry.get(handle).map(|entry| entry.termination())
    }

    /// Returns the number of active pipelines.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.registry.len()
    }

    /// Returns true if `handle` has an active pipeline.
    #[must_use]
    pub fn is_active(&self, handle: &StreamHandle) -> bool {
        self.registry.contains(handle)
    }

    /// Stops every pipeline and waits for all of them to finish.
    pub async fn shutdown(&self) {
        let entries = self.registry.drain();
        if entries.is_empty() {
            return;
        }

        info!(streams = entries.len(), "shutting down log router");
        let waits: Vec<_> = entries
            .iter()
            .map(|entry| {
                entry.cancel();
                entry.termination().wait()
            })
            .collect();
        futures::future::join_all(waits).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;
    use crate::input::{BoxFuture, InputStream};
    use crate::store::MemoryStoreFactory;
    use crate::types::LogRecord;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// Hands out in-memory duplex streams and keeps the writer ends.
    #[derive(Default)]
    struct DuplexOpener {
        writers: Mutex<HashMap<StreamHandle, DuplexStream>>,
    }

    impl DuplexOpener {
        fn writer(&self, handle: &str) -> DuplexStream {
            self.writers
                .lock()
                .remove(&StreamHandle::from(handle))
                .expect("stream opened")
        }
    }

    impl InputOpener for DuplexOpener {
        fn open<'a>(&'a self, handle: &'a StreamHandle) -> BoxFuture<'a, io::Result<InputStream>> {
            Box::pin(async move {
                let (writer, reader) = tokio::io::duplex(64 * 1024);
                self.writers.lock().insert(handle.clone(), writer);
                Ok(Box::new(reader) as InputStream)
            })
        }
    }

    struct FailingOpener;

    impl InputOpener for FailingOpener {
        fn open<'a>(&'a self, _handle: &'a StreamHandle) -> BoxFuture<'a, io::Result<InputStream>> {
            Box::pin(async { Err(io::Error::new(io::ErrorKind::NotFound, "no such fifo")) })
        }
    }

    /// Places every stream under a fixed file name in a scratch root.
    struct FixedPaths(PathBuf);

    impl LogPathPolicy for FixedPaths {
        fn resolve(&self, metadata: &StreamMetadata) -> Result<PathBuf> {
            Ok(self.0.join(metadata.container_id.as_str()))
        }
    }

    fn memory_router(inputs: Arc<dyn InputOpener>) -> (Arc<MemoryStoreFactory>, LogRouter) {
        let stores = Arc::new(MemoryStoreFactory::new(64));
        let router = LogRouter::new(
            DriverConfig::default(),
            Arc::clone(&stores) as Arc<dyn LogStoreFactory>,
            Arc::new(FixedPaths(PathBuf::from("/logs"))),
            inputs,
        );
        (stores, router)
    }

    async fn send(writer: &mut DuplexStream, line: &str) {
        let frame = encode_frame(LogRecord::new(line, "stdout", 1)).expect("encode");
        writer.write_all(&frame).await.expect("write");
    }

    #[tokio::test]
    async fn router_start_registers_pipeline() {
        let opener = Arc::new(DuplexOpener::default());
        let (stores, router) = memory_router(Arc::clone(&opener) as Arc<dyn InputOpener>);

        router
            .start(StreamHandle::from("/run/c1"), StreamMetadata::new("c1"))
            .await
            .expect("start");

        assert!(router.is_active(&StreamHandle::from("/run/c1")));
        assert_eq!(router.active_streams(), 1);

        let mut writer = opener.writer("/run/c1");
        send(&mut writer, "hello").await;

        let store = stores.store(&ContainerId::from("c1")).expect("store");
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("record not ingested");
    }

    #[tokio::test]
    async fn router_start_passes_resolved_path_to_storage() {
        let seen = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&seen);
        let stores = move |metadata: &StreamMetadata| {
            *captured.lock() = metadata.log_path.clone();
            Ok::<_, LogDriverError>(StorageLogger::read_capable(crate::store::MemoryLogStore::new(4)))
        };
        let router = LogRouter::new(
            DriverConfig::default(),
            Arc::new(stores),
            Arc::new(FixedPaths(PathBuf::from("/logs"))),
            Arc::new(DuplexOpener::default()),
        );

        router
            .start(StreamHandle::from("/run/c1"), StreamMetadata::new("c1"))
            .await
            .expect("start");
        assert_eq!(*seen.lock(), Some(PathBuf::from("/logs/c1")));
    }

    #[tokio::test]
    async fn router_start_runs_storage_setup_off_the_runtime_thread() {
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let entered_tx = Mutex::new(Some(entered_tx));
        let go_rx = Mutex::new(go_rx);

        // Blocks until the test task, sharing the single runtime thread, lets it go.
        let stores = move |_: &StreamMetadata| {
            if let Some(tx) = entered_tx.lock().take() {
                let _ = tx.send(());
            }
            go_rx
                .lock()
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| LogDriverError::Config("storage setup blocked the runtime".into()))?;
            Ok::<_, LogDriverError>(StorageLogger::read_capable(crate::store::MemoryLogStore::new(4)))
        };
        let router = Arc::new(LogRouter::new(
            DriverConfig::default(),
            Arc::new(stores),
            Arc::new(FixedPaths(PathBuf::from("/logs"))),
            Arc::new(DuplexOpener::default()),
        ));

        let starting = Arc::clone(&router);
        let start = tokio::spawn(async move {
            starting
                .start(StreamHandle::from("/run/c1"), StreamMetadata::new("c1"))
                .await
        });

        entered_rx.await.expect("factory called");
        go_tx.send(()).expect("release factory");
        start.await.expect("join").expect("start");
        assert!(router.is_active(&StreamHandle::from("/run/c1")));
    }

    #[tokio::test]
    async fn router_rejects_second_start_on_same_handle() {
        let (_, router) = memory_router(Arc::new(DuplexOpener::default()));
        let handle = StreamHandle::from("/run/c1");

        router.start(handle.clone(), StreamMetadata::new("c1")).await.expect("start");
        let err = router
            .start(handle.clone(), StreamMetadata::new("c2"))
            .await
            .expect_err("duplicate");

        assert!(matches!(err, LogDriverError::AlreadyActive(_)));
        assert_eq!(router.active_streams(), 1);
    }

    #[tokio::test]
    async fn router_input_failure_leaves_nothing_registered() {
        let (_, router) = memory_router(Arc::new(FailingOpener));

        let err = router
            .start(StreamHandle::from("/run/c1"), StreamMetadata::new("c1"))
            .await
            .expect_err("open fails");

        assert!(matches!(err, LogDriverError::Setup { .. }));
        assert_eq!(router.active_streams(), 0);
        assert!(matches!(
            router.read(&ContainerId::from("c1"), ReadConfig::new()),
            Err(LogDriverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn router_stop_cancels_and_deregisters() {
        let (_, router) = memory_router(Arc::new(DuplexOpener::default()));
        let handle = StreamHandle::from("/run/c1");

        let termination = router.start(handle.clone(), StreamMetadata::new("c1")).await.expect("start");
        router.stop(&handle).expect("stop");

        assert!(!router.is_active(&handle));
        let exit = tokio::time::timeout(Duration::from_secs(5), termination.wait())
            .await
            .expect("pipeline did not stop");
        assert_eq!(exit, PipelineExit::Stopped);

        // Unknown handles are ignored.
        router.stop(&handle).expect("second stop");
    }

    #[tokio::test]
    async fn router_end_of_stream_deregisters_pipeline() {
        let opener = Arc::new(DuplexOpener::default());
        let (_, router) = memory_router(Arc::clone(&opener) as Arc<dyn InputOpener>);
        let handle = StreamHandle::from("/run/c1");

        let termination = router.start(handle.clone(), StreamMetadata::new("c1")).await.expect("start");
        drop(opener.writer("/run/c1"));

        assert_eq!(termination.wait().await, PipelineExit::EndOfStream);
        assert!(!router.is_active(&handle));
        assert!(router.registry().get_by_container(&ContainerId::from("c1")).is_none());
    }

    #[tokio::test]
    async fn router_restart_survives_old_pipeline_exit() {
        let opener = Arc::new(DuplexOpener::default());
        let (_, router) = memory_router(Arc::clone(&opener) as Arc<dyn InputOpener>);
        let handle = StreamHandle::from("/run/c1");

        let old = router.start(handle.clone(), StreamMetadata::new("c1")).await.expect("start");
        let old_writer = opener.writer("/run/c1");
        router.stop(&handle).expect("stop");
        router.start(handle.clone(), StreamMetadata::new("c1")).await.expect("restart");

        drop(old_writer);
        old.wait().await;
        assert!(router.is_active(&handle));
    }

    #[tokio::test]
    async fn router_read_unknown_container_is_not_found() {
        let (_, router) = memory_router(Arc::new(DuplexOpener::default()));
        assert!(matches!(
            router.read(&ContainerId::from("ghost"), ReadConfig::new()),
            Err(LogDriverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn router_read_write_only_is_unsupported() {
        struct Discard;
        impl crate::traits::LogWriter for Discard {
            fn write(&self, _record: &LogRecord) -> Result<()> {
                Ok(())
            }
        }

        let router = LogRouter::new(
            DriverConfig::default(),
            Arc::new(|_: &StreamMetadata| Ok::<_, LogDriverError>(StorageLogger::write_only(Discard))),
            Arc::new(FixedPaths(PathBuf::from("/logs"))),
            Arc::new(DuplexOpener::default()),
        );
        router
            .start(StreamHandle::from("/run/c1"), StreamMetadata::new("c1"))
            .await
            .expect("start");

        assert!(matches!(
            router.read(&ContainerId::from("c1"), ReadConfig::new()),
            Err(LogDriverError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn router_shutdown_stops_everything() {
        let (_, router) = memory_router(Arc::new(DuplexOpener::default()));
        let a = router.start(StreamHandle::from("/run/a"), StreamMetadata::new("a")).await.expect("start");
        let b = router.start(StreamHandle::from("/run/b"), StreamMetadata::new("b")).await.expect("start");

        tokio::time::timeout(Duration::from_secs(5), router.shutdown())
            .await
            .expect("shutdown hung");

        assert_eq!(router.active_streams(), 0);
        assert_eq!(a.exit(), Some(PipelineExit::Stopped));
        assert_eq!(b.exit(), Some(PipelineExit::Stopped));
    }
}
