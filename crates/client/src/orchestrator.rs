//! Batched, retrying chunk transmission.
//!
//! The missing indices are sent in batches of `concurrency` chunks. A batch
//! is fully settled before the next one starts; cancellation is observed
//! only between batches. Chunks that exhaust their retries are collected
//! and get exactly one more pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use chunkdrop_protocol::frame::ChunkHeader;
use chunkdrop_transfer::{ChunkPlan, ChunkSource, TransferError, checksum_bytes, progress_percent};

use crate::error::{TransportError, UploadError};
use crate::transport::UploadTransport;
use crate::types::{UploadConfig, UploadEvent};

/// Work handed to one orchestration run.
pub struct ChunkJob {
    pub upload_id: String,
    pub plan: ChunkPlan,
    pub source: Arc<dyn ChunkSource>,
    /// Indices to send, ascending.
    pub missing: Vec<u32>,
    /// Indices the server already holds; the progress baseline.
    pub completed: BTreeSet<u32>,
}

/// Retry bookkeeping for one chunk within one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkAttempt {
    pub index: u32,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl ChunkAttempt {
    fn new(index: u32) -> Self {
        Self {
            index,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// How one chunk's attempts ended.
enum Settled {
    Acked,
    Exhausted,
    Rejected(String),
    Source(TransferError),
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub chunks_sent: u32,
    /// Completed set as last observed: server status united with acks.
    pub completed: BTreeSet<u32>,
    pub passes: u32,
}

struct RunState {
    completed: BTreeSet<u32>,
    sent: u32,
}

/// Drives chunk transmission for one session.
pub struct Orchestrator<'a> {
    transport: &'a dyn UploadTransport,
    config: &'a UploadConfig,
    cancel: CancellationToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(transport: &'a dyn UploadTransport, config: &'a UploadConfig, cancel: CancellationToken) -> Self {
        Self {
            transport,
            config,
            cancel,
        }
    }

    /// Sends every index in `job.missing`.
    ///
    /// Returns [`UploadError::Cancelled`] when cancelled between batches,
    /// [`UploadError::ChunkRejected`] when the server refused a chunk for a
    /// non-retryable reason, and [`UploadError::Incomplete`] with the
    /// still-failing indices after the second pass. The session is never
    /// touched on failure.
    pub async fn run(
        &self,
        job: &ChunkJob,
        events_tx: &mpsc::Sender<UploadEvent>,
    ) -> Result<RunSummary, UploadError> {
        let mut state = RunState {
            completed: job.completed.clone(),
            sent: 0,
        };
        self.emit_progress(job, &state.completed, events_tx);

        let mut passes = 1;
        let mut failed = self.run_pass(1, job, &job.missing, &mut state, events_tx).await?;
        if !failed.is_empty() {
            info!(upload_id = %job.upload_id, failed = ?failed, "retrying failed chunks in a second pass");
            passes = 2;
            failed = self.run_pass(2, job, &failed, &mut state, events_tx).await?;
        }

        if !failed.is_empty() {
            error!(upload_id = %job.upload_id, failed = ?failed, "chunks still failing after second pass");
            return Err(UploadError::Incomplete { failed });
        }

        Ok(RunSummary {
            chunks_sent: state.sent,
            completed: state.completed,
            passes,
        })
    }

    /// One pass over `indices`. Returns the indices that exhausted retries.
    async fn run_pass(
        &self,
        pass: u32,
        job: &ChunkJob,
        indices: &[u32],
        state: &mut RunState,
        events_tx: &mpsc::Sender<UploadEvent>,
    ) -> Result<Vec<u32>, UploadError> {
        let mut failed = Vec::new();
        let mut rejected: Option<(u32, String)> = None;

        for batch in indices.chunks(self.config.concurrency.max(1)) {
            if self.cancel.is_cancelled() {
                info!(upload_id = %job.upload_id, pass, "upload cancelled, session left intact");
                return Err(UploadError::Cancelled);
            }

            let settled = join_all(
                batch
                    .iter()
                    .map(|&index| self.send_with_retry(job, index, events_tx)),
            )
            .await;

            let mut source_error = None;
            for (attempt, outcome) in settled {
                match outcome {
                    Settled::Acked => {
                        state.completed.insert(attempt.index);
                        state.sent += 1;
                    }
                    Settled::Exhausted => failed.push(attempt.index),
                    Settled::Rejected(reason) => {
                        rejected.get_or_insert((attempt.index, reason));
                    }
                    Settled::Source(e) => {
                        source_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = source_error {
                error!(upload_id = %job.upload_id, error = %e, "cannot read source");
                return Err(e.into());
            }

            self.refresh_progress(job, &mut state.completed, events_tx).await;
        }

        info!(upload_id = %job.upload_id, pass, failed = failed.len(), "pass finished");
        emit(
            events_tx,
            UploadEvent::PassFinished {
                upload_id: job.upload_id.clone(),
                pass,
                failed: failed.clone(),
            },
        );

        if let Some((index, reason)) = rejected {
            return Err(UploadError::ChunkRejected { index, reason });
        }
        Ok(failed)
    }

    /// Sends one chunk, retrying transient failures with backoff.
    async fn send_with_retry(
        &self,
        job: &ChunkJob,
        index: u32,
        events_tx: &mpsc::Sender<UploadEvent>,
    ) -> (ChunkAttempt, Settled) {
        let mut attempt = ChunkAttempt::new(index);

        let data = match read_chunk(job, index).await {
            Ok(data) => data,
            Err(e) => return (attempt, Settled::Source(e)),
        };
        let header = ChunkHeader {
            id: String::new(),
            upload_id: job.upload_id.clone(),
            index,
            total_chunks: job.plan.total_chunks(),
            checksum: checksum_bytes(&data),
        };

        loop {
            let result = tokio::time::timeout(self.config.chunk_timeout, self.transport.put_chunk(&header, &data))
                .await
                .unwrap_or(Err(TransportError::Timeout));

            let err = match result {
                Ok(ack) => {
                    debug!(
                        upload_id = %job.upload_id,
                        index,
                        already_complete = ack.already_complete,
                        completed = ack.completed_count,
                        "chunk acknowledged"
                    );
                    return (attempt, Settled::Acked);
                }
                Err(e) => e,
            };

            attempt.last_error = Some(err.to_string());
            if !err.is_retryable() {
                warn!(upload_id = %job.upload_id, index, error = %err, "chunk rejected");
                return (attempt, Settled::Rejected(err.to_string()));
            }

            attempt.retry_count += 1;
            if !self.config.retry.allows_retry(attempt.retry_count) {
                warn!(
                    upload_id = %job.upload_id,
                    index,
                    attempts = attempt.retry_count,
                    error = %err,
                    "chunk failed, giving up for this pass"
                );
                return (attempt, Settled::Exhausted);
            }

            let delay = self.config.retry.delay_for_attempt(attempt.retry_count);
            warn!(
                upload_id = %job.upload_id,
                index,
                attempt = attempt.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "chunk send failed, retrying"
            );
            emit(
                events_tx,
                UploadEvent::ChunkRetry {
                    upload_id: job.upload_id.clone(),
                    index,
                    attempt: attempt.retry_count,
                    delay,
                    error: err.to_string(),
                },
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Merges the server's completed set into `completed` and reports it.
    async fn refresh_progress(
        &self,
        job: &ChunkJob,
        completed: &mut BTreeSet<u32>,
        events_tx: &mpsc::Sender<UploadEvent>,
    ) {
        let total = job.plan.total_chunks();
        match tokio::time::timeout(self.config.request_timeout, self.transport.get_status(&job.upload_id)).await {
            Ok(Ok(status)) => {
                completed.extend(status.completed_chunks.into_iter().filter(|&i| i < total));
            }
            Ok(Err(e)) => {
                debug!(upload_id = %job.upload_id, error = %e, "status refresh failed, using acknowledged chunks");
            }
            Err(_) => {
                debug!(upload_id = %job.upload_id, "status refresh timed out, using acknowledged chunks");
            }
        }
        self.emit_progress(job, completed, events_tx);
    }

    fn emit_progress(&self, job: &ChunkJob, completed: &BTreeSet<u32>, events_tx: &mpsc::Sender<UploadEvent>) {
        emit(
            events_tx,
            UploadEvent::Progress {
                upload_id: job.upload_id.clone(),
                percent: progress_percent(&job.plan, completed),
                completed_chunks: completed.len() as u32,
                total_chunks: job.plan.total_chunks(),
            },
        );
    }
}

async fn read_chunk(job: &ChunkJob, index: u32) -> Result<Vec<u8>, TransferError> {
    let range = job.plan.range_of(index)?;
    let source = Arc::clone(&job.source);
    tokio::task::spawn_blocking(move || source.read_range(range))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
}

/// Publishes `event` without waiting; a full or closed channel drops it.
pub(crate) fn emit(events_tx: &mpsc::Sender<UploadEvent>, event: UploadEvent) {
    if let Err(e) = events_tx.try_send(event) {
        trace!("upload event dropped: {e}");
    }
}
