//! Per-container ingestion pipelines.
//!
//! A pipeline decodes length-delimited frames from the container's input
//! stream and writes each record to storage, in input order, until it is
//! cancelled or the writer side closes. Bad frames and failed writes are
//! logged and skipped; they never end the pipeline.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::LogEntryCodec;
use crate::config::DriverConfig;
use crate::error::LogDriverError;
use crate::input::InputStream;
use crate::traits::StorageLogger;
use crate::types::{ContainerId, LogRecord, StreamHandle};

const READ_CHUNK: usize = 8 * 1024;

/// Why a pipeline stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// The pipeline was cancelled by a stop or shutdown.
    Stopped,
    /// The writer side of the input stream closed.
    EndOfStream,
    /// The pipeline task ended without reporting, e.g. it panicked.
    Aborted,
}

/// Counters kept by a pipeline over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionStats {
    /// Records written to storage.
    pub forwarded: u64,
    /// Records storage refused.
    pub dropped: u64,
    /// Frames that could not be decoded and read errors.
    pub decode_errors: u64,
}

/// Awaitable termination signal of a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineTermination {
    receiver: watch::Receiver<Option<PipelineExit>>,
}

/// Publishing half of a termination signal, owned by the pipeline task.
#[derive(Debug)]
pub struct TerminationPublisher {
    sender: watch::Sender<Option<PipelineExit>>,
}

/// Creates a connected termination publisher and signal.
#[must_use]
pub fn termination_channel() -> (TerminationPublisher, PipelineTermination) {
    let (sender, receiver) = watch::channel(None);
    (
        TerminationPublisher { sender },
        PipelineTermination { receiver },
    )
}

impl TerminationPublisher {
    /// Publishes the exit reason to every waiter.
    pub fn publish(self, exit: PipelineExit) {
        self.sender.send_replace(Some(exit));
    }
}

impl PipelineTermination {
    /// Waits for the pipeline to finish.
    pub async fn wait(mut self) -> PipelineExit {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(exit) => exit.unwrap_or(PipelineExit::Aborted),
            Err(_) => PipelineExit::Aborted,
        }
    }

    /// Returns the exit reason if the pipeline already finished.
    #[must_use]
    pub fn exit(&self) -> Option<PipelineExit> {
        *self.receiver.borrow()
    }

    /// Returns true once the pipeline finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.exit().is_some()
    }
}

/// Decode loop for one container's log stream.
pub struct IngestionPipeline {
    handle: StreamHandle,
    container_id: ContainerId,
    input: InputStream,
    logger: StorageLogger,
    cancel: CancellationToken,
    codec: LogEntryCodec,
    error_threshold: u32,
    error_backoff: Duration,
    stats: IngestionStats,
}

impl IngestionPipeline {
    /// Creates a pipeline over an opened input stream.
    #[must_use]
    pub fn new(
        handle: StreamHandle,
        container_id: ContainerId,
        input: InputStream,
        logger: StorageLogger,
        cancel: CancellationToken,
        config: &DriverConfig,
    ) -> Self {
        Self {
            handle,
            container_id,
            input,
            logger,
            cancel,
            codec: LogEntryCodec::with_max_frame_size(config.max_frame_size),
            error_threshold: config.decode_error_threshold.max(1),
            error_backoff: config.decode_error_backoff(),
            stats: IngestionStats::default(),
        }
    }

    /// Runs the decode loop to completion.
    ///
    /// Returns once the pipeline is cancelled or the input reaches
    /// end-of-stream. The input stream is dropped and the storage logger
    /// closed before returning.
    pub async fn run(mut self) -> PipelineExit {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut consecutive_errors = 0u32;

        debug!(handle = %self.handle, container_id = %self.container_id, "ingestion started");

        let exit = loop {
            if self.cancel.is_cancelled() {
                break PipelineExit::Stopped;
            }

            match self.codec.decode(&mut buf) {
                Ok(Some(record)) => {
                    consecutive_errors = 0;
                    self.forward(&record);
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    if self.recover(&err, consecutive_errors).await {
                        break PipelineExit::Stopped;
                    }
                    continue;
                }
            }

            buf.reserve(READ_CHUNK);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break PipelineExit::Stopped,
                read = self.input.read_buf(&mut buf) => match read {
                    Ok(0) => break PipelineExit::EndOfStream,
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        consecutive_errors = consecutive_errors.saturating_add(1);
                        if self.recover(&LogDriverError::Io(e), consecutive_errors).await {
                            break PipelineExit::Stopped;
                        }
                    }
                },
            }
        };

        if exit == PipelineExit::EndOfStream && !buf.is_empty() {
            debug!(
                handle = %self.handle,
                bytes = buf.len(),
                "discarding incomplete frame at end of stream"
            );
        }

        self.finish(exit)
    }

    fn forward(&mut self, record: &LogRecord) {
        match self.logger.write(record) {
            Ok(()) => self.stats.forwarded += 1,
            Err(e) => {
                self.stats.dropped += 1;
                error!(
                    container_id = %self.container_id,
                    source = %record.source,
                    time_nano = record.time_nano,
                    error = %e,
                    "error writing log message"
                );
            }
        }
    }

    /// Logs a decode or read error and applies backoff once errors pile up.
    /// Returns true if the pipeline was cancelled while backing off.
    async fn recover(&mut self, err: &LogDriverError, consecutive: u32) -> bool {
        self.stats.decode_errors += 1;
        warn!(
            handle = %self.handle,
            container_id = %self.container_id,
            consecutive,
            error = %err,
            "error reading log stream, resynchronising"
        );

        if consecutive < self.error_threshold {
            return false;
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(self.error_backoff) => false,
        }
    }

    fn finish(self, exit: PipelineExit) -> PipelineExit {
        let Self {
            handle,
            container_id,
            input,
            logger,
            stats,
            ..
        } = self;
        drop(input);

        if let Err(e) = logger.close() {
            warn!(container_id = %container_id, error = %e, "error closing storage logger");
        }

        info!(
            handle = %handle,
            container_id = %container_id,
            ?exit,
            forwarded = stats.forwarded,
            dropped = stats.dropped,
            decode_errors = stats.decode_errors,
            "log stream shut down"
        );
        exit
    }
}
