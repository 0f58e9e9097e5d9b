//! Async checkpoint writer for non-blocking saves
//!
//! A single task drains a bounded queue, so writes for a run are
//! strictly ordered by submission. Each write goes through the storage
//! backend, which publishes atomically; transient failures are retried
//! with exponential backoff before the writer reports the save failed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use runtime_core::config::RetryConfig;
use runtime_core::{Result, Step};
use storage::StorageBackend;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Request to write one encoded artifact
#[derive(Debug)]
pub struct WriteRequest {
    /// Completed-step count the artifact holds
    pub step: Step,

    /// Storage key of the final artifact
    pub path: String,

    /// Fully encoded artifact bytes
    pub data: Bytes,
}

/// Event reported by the writer task
#[derive(Debug)]
pub enum WriterEvent {
    /// Artifact published under its final path
    Published {
        step: Step,
        path: String,
        size_bytes: u64,
    },
    /// Write failed after exhausting retries
    Failed {
        step: Step,
        path: String,
        error: String,
    },
}

/// Handle keeping the writer task alive
pub struct CheckpointWriter {
    _task: tokio::task::JoinHandle<()>,
}

impl CheckpointWriter {
    /// Spawn the writer task over a storage backend
    pub fn spawn(
        storage: Arc<dyn StorageBackend>,
        retry: RetryConfig,
        queue_depth: usize,
        event_tx: mpsc::Sender<WriterEvent>,
    ) -> (mpsc::Sender<WriteRequest>, Self) {
        let (tx, rx) = mpsc::channel::<WriteRequest>(queue_depth.max(1));
        let task = tokio::spawn(Self::writer_loop(rx, storage, retry, event_tx));
        (tx, Self { _task: task })
    }

    /// Main writer loop, one request at a time in submission order
    async fn writer_loop(
        mut rx: mpsc::Receiver<WriteRequest>,
        storage: Arc<dyn StorageBackend>,
        retry: RetryConfig,
        event_tx: mpsc::Sender<WriterEvent>,
    ) {
        info!("Checkpoint writer started");

        while let Some(request) = rx.recv().await {
            let step = request.step;
            let path = request.path.clone();

            match Self::write_with_retry(storage.as_ref(), &retry, &request).await {
                Ok(size_bytes) => {
                    let _ = event_tx
                        .send(WriterEvent::Published {
                            step,
                            path,
                            size_bytes,
                        })
                        .await;
                }
                Err(e) => {
                    error!(step, path = %path, error = %e, "Checkpoint write failed");
                    let _ = event_tx
                        .send(WriterEvent::Failed {
                            step,
                            path,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }

        info!("Checkpoint writer stopped");
    }

    /// Write one artifact, retrying transient storage failures
    #[instrument(skip(storage, retry, request), fields(step = request.step, path = %request.path))]
    async fn write_with_retry(
        storage: &dyn StorageBackend,
        retry: &RetryConfig,
        request: &WriteRequest,
    ) -> Result<u64> {
        let start = std::time::Instant::now();
        let mut attempt = 0u32;

        loop {
            match storage.write(&request.path, request.data.clone()).await {
                Ok(size_bytes) => {
                    let elapsed = start.elapsed();
                    info!(
                        step = request.step,
                        size_bytes,
                        elapsed_ms = elapsed.as_millis() as u64,
                        throughput_mbps =
                            (size_bytes as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64(),
                        "Checkpoint published"
                    );
                    return Ok(size_bytes);
                }
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    let delay = backoff_delay(retry, attempt);
                    warn!(
                        step = request.step,
                        attempt = attempt + 1,
                        max_retries = retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Checkpoint write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(step = request.step, attempts = attempt + 1, "Giving up on write");
                    return Err(e);
                }
            }
        }
    }
}

/// Backoff delay for a retry attempt, jittered when configured
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let delay = retry.delay_for_attempt(attempt);
    if retry.jitter {
        delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    } else {
        delay
    }
}
