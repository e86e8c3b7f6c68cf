//! End-to-end upload flow: prepare, open or resume, send, finalize.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chunkdrop_protocol::messages::{
    CompleteRequest, InitSessionRequest, OperationResult, SessionStatusResponse,
};
use chunkdrop_protocol::types::{SessionStatus, UploadProgress};
use chunkdrop_transfer::{
    ChunkPlan, ChunkSource, FileChunkSource, Fingerprint, TransferError, fingerprint_file, progress_snapshot,
    remaining, validate_file_name,
};

use crate::error::{TransportError, UploadError};
use crate::mirror::{LocalMirror, MirrorEntry};
use crate::orchestrator::{ChunkJob, Orchestrator, emit};
use crate::transport::{TransportFuture, UploadTransport};
use crate::types::{UploadConfig, UploadEvent, UploadOutcome, UploadRequest};

/// Where the session parameters came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    New,
    Mirror,
    Explicit,
}

/// Parameters of the session this run works on.
struct SessionParams {
    upload_id: String,
    file_name: String,
    file_size: u64,
    content_hash: String,
    chunk_size: u64,
    origin: Origin,
}

impl SessionParams {
    fn init_request(&self, plan: &ChunkPlan) -> InitSessionRequest {
        InitSessionRequest {
            upload_id: self.upload_id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            content_hash: self.content_hash.clone(),
            total_chunks: plan.total_chunks(),
            chunk_size: self.chunk_size,
        }
    }
}

/// Uploads files over an [`UploadTransport`], resuming unfinished sessions.
pub struct Uploader {
    transport: Arc<dyn UploadTransport>,
    config: UploadConfig,
    mirror: Option<LocalMirror>,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
}

impl Uploader {
    pub fn new(transport: Arc<dyn UploadTransport>, config: UploadConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            transport,
            config,
            mirror: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Remembers unfinished uploads in `mirror` so they can be resumed
    /// without re-hashing.
    pub fn with_mirror(mut self, mirror: LocalMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Uploads `req.path`, resuming a previous session when one is known.
    ///
    /// Only the chunks the server reports as missing are sent. On any
    /// error, including cancellation, the server session is left as it is
    /// so a later call can continue.
    pub async fn upload(&self, req: &UploadRequest, cancel: CancellationToken) -> Result<UploadOutcome, UploadError> {
        self.config.validate()?;

        let source = {
            let path = req.path.clone();
            Arc::new(tokio::task::spawn_blocking(move || FileChunkSource::open(&path)).await??)
        };
        let file_size = source.len();
        let file_name = match &req.file_name {
            Some(name) => name.clone(),
            None => req
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| TransferError::InvalidFileName(req.path.display().to_string()))?,
        };
        validate_file_name(&file_name)?;

        let mut params = match &req.upload_id {
            Some(id) => self.explicit_session(id, &req.path, &file_name, file_size).await?,
            None => match self.mirrored_session(&req.path, file_size) {
                Some(params) => params,
                None => self.fresh_session(&req.path, &file_name, file_size).await?,
            },
        };

        let mut plan = ChunkPlan::new(file_size, params.chunk_size)?;
        let init = match self.call(self.transport.init_session(&params.init_request(&plan))).await {
            Err(UploadError::Conflict(reason)) if params.origin == Origin::Mirror => {
                warn!(
                    upload_id = %params.upload_id,
                    reason = %reason,
                    "remembered session conflicts with server, starting a new one"
                );
                self.forget(&params.upload_id);
                params = self.fresh_session(&req.path, &file_name, file_size).await?;
                plan = ChunkPlan::new(file_size, params.chunk_size)?;
                self.call(self.transport.init_session(&params.init_request(&plan)))
                    .await?
            }
            other => other?,
        };
        let upload_id = params.upload_id.clone();
        let resumed = !init.created;
        self.remember(&params, &req.path, plan.total_chunks(), &init.completed_chunks);

        let status = self.call(self.transport.get_status(&upload_id)).await?;
        if let Some(archive_id) = finished_archive(&status) {
            info!(upload_id = %upload_id, archive_id = %archive_id, "upload already finalized");
            self.forget(&upload_id);
            return Ok(UploadOutcome {
                upload_id,
                archive_id,
                file_size,
                total_chunks: plan.total_chunks(),
                chunks_sent: 0,
                resumed: true,
            });
        }

        let missing = remaining(plan.total_chunks(), &status.completed_chunks);
        if let Some(mirror) = &self.mirror {
            mirror.update_hint(&upload_id, &status.completed_chunks);
        }
        info!(
            upload_id = %upload_id,
            file = %file_name,
            size = file_size,
            total = plan.total_chunks(),
            remaining = missing.len(),
            resumed,
            "upload prepared"
        );
        emit(
            &self.events_tx,
            UploadEvent::Prepared {
                upload_id: upload_id.clone(),
                file_name: file_name.clone(),
                file_size,
                total_chunks: plan.total_chunks(),
                remaining: missing.len() as u32,
                resumed,
            },
        );

        let job = ChunkJob {
            upload_id: upload_id.clone(),
            plan,
            source,
            missing,
            completed: status
                .completed_chunks
                .iter()
                .copied()
                .filter(|&i| i < plan.total_chunks())
                .collect::<BTreeSet<u32>>(),
        };
        let summary = Orchestrator::new(self.transport.as_ref(), &self.config, cancel)
            .run(&job, &self.events_tx)
            .await
            .inspect_err(|e| self.report_failure(&upload_id, e))?;

        emit(
            &self.events_tx,
            UploadEvent::Finalizing {
                upload_id: upload_id.clone(),
            },
        );
        let complete = CompleteRequest {
            upload_id: upload_id.clone(),
            content_hash: params.content_hash.clone(),
            metadata: req.metadata.clone(),
        };
        let finalize_timeout = self.config.chunk_timeout.max(self.config.request_timeout);
        let done = self
            .call_within(finalize_timeout, self.transport.complete(&complete))
            .await
            .inspect_err(|e| self.report_failure(&upload_id, e))?;

        self.forget(&upload_id);
        info!(upload_id = %upload_id, archive_id = %done.archive_id, sent = summary.chunks_sent, "upload complete");
        emit(
            &self.events_tx,
            UploadEvent::Completed {
                upload_id: upload_id.clone(),
                archive_id: done.archive_id.clone(),
            },
        );
        Ok(UploadOutcome {
            upload_id,
            archive_id: done.archive_id,
            file_size,
            total_chunks: plan.total_chunks(),
            chunks_sent: summary.chunks_sent,
            resumed,
        })
    }

    /// Progress of `upload_id` as the server sees it.
    pub async fn status(&self, upload_id: &str) -> Result<UploadProgress, UploadError> {
        let status = self.call(self.transport.get_status(upload_id)).await?;
        let plan = ChunkPlan::new(status.file_size, status.chunk_size)?;
        Ok(progress_snapshot(
            upload_id,
            status.status,
            &plan,
            &status.completed_chunks,
        ))
    }

    /// Deletes the server session and the local record of `upload_id`.
    pub async fn cancel(&self, upload_id: &str) -> Result<OperationResult, UploadError> {
        let result = self.call(self.transport.cancel(upload_id)).await?;
        self.forget(upload_id);
        info!(upload_id, "upload cancelled");
        Ok(result)
    }

    /// Session named by the caller; the server must already know it.
    async fn explicit_session(
        &self,
        upload_id: &str,
        path: &Path,
        file_name: &str,
        file_size: u64,
    ) -> Result<SessionParams, UploadError> {
        let status = self.call(self.transport.get_status(upload_id)).await?;
        if status.file_size != file_size {
            return Err(UploadError::Conflict(format!(
                "session {upload_id} expects {} bytes, {} has {file_size}",
                status.file_size,
                path.display()
            )));
        }

        let remembered = self
            .mirror
            .as_ref()
            .and_then(|m| m.load(upload_id))
            .filter(|e| e.source_path == path && e.file_size == file_size);
        let content_hash = match remembered {
            Some(entry) => entry.content_hash,
            None => {
                let session: Fingerprint = status.content_hash.parse()?;
                if session.is_fallback() {
                    // A fallback key cannot be recomputed from the file.
                    status.content_hash.clone()
                } else {
                    let local = fingerprint(path, file_name, file_size).await?;
                    if local != status.content_hash {
                        return Err(UploadError::Conflict(format!(
                            "session {upload_id} was opened for different content than {}",
                            path.display()
                        )));
                    }
                    local
                }
            }
        };

        Ok(SessionParams {
            upload_id: upload_id.to_string(),
            file_name: status.file_name,
            file_size,
            content_hash,
            chunk_size: status.chunk_size,
            origin: Origin::Explicit,
        })
    }

    /// Unfinished session remembered for this source, if any.
    fn mirrored_session(&self, path: &Path, file_size: u64) -> Option<SessionParams> {
        let entry = self.mirror.as_ref()?.find_resumable(path, file_size)?;
        info!(upload_id = %entry.upload_id, "resuming remembered upload");
        Some(SessionParams {
            upload_id: entry.upload_id,
            file_name: entry.file_name,
            file_size,
            content_hash: entry.content_hash,
            chunk_size: entry.chunk_size,
            origin: Origin::Mirror,
        })
    }

    async fn fresh_session(&self, path: &Path, file_name: &str, file_size: u64) -> Result<SessionParams, UploadError> {
        Ok(SessionParams {
            upload_id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.to_string(),
            file_size,
            content_hash: fingerprint(path, file_name, file_size).await?,
            chunk_size: self.config.chunk_size,
            origin: Origin::New,
        })
    }

    fn remember(&self, params: &SessionParams, path: &Path, total_chunks: u32, completed: &[u32]) {
        if let Some(mirror) = &self.mirror {
            mirror.save(&MirrorEntry {
                upload_id: params.upload_id.clone(),
                file_name: params.file_name.clone(),
                file_size: params.file_size,
                content_hash: params.content_hash.clone(),
                total_chunks,
                chunk_size: params.chunk_size,
                source_path: path.to_path_buf(),
                completed_hint: completed.to_vec(),
                updated_at: Utc::now(),
            });
        }
    }

    fn forget(&self, upload_id: &str) {
        if let Some(mirror) = &self.mirror {
            mirror.remove(upload_id);
        }
    }

    fn report_failure(&self, upload_id: &str, err: &UploadError) {
        if matches!(err, UploadError::Cancelled) {
            info!(upload_id, "upload stopped, session kept for resume");
        } else {
            error!(upload_id, error = %err, "upload failed");
        }
        emit(
            &self.events_tx,
            UploadEvent::Failed {
                upload_id: upload_id.to_string(),
                error: err.to_string(),
            },
        );
    }

    async fn call<T>(&self, fut: TransportFuture<'_, T>) -> Result<T, UploadError> {
        self.call_within(self.config.request_timeout, fut).await
    }

    async fn call_within<T>(&self, timeout: Duration, fut: TransportFuture<'_, T>) -> Result<T, UploadError> {
        tokio::time::timeout(timeout, fut)
            .await
            .unwrap_or(Err(TransportError::Timeout))
            .map_err(UploadError::from)
    }
}

fn finished_archive(status: &SessionStatusResponse) -> Option<String> {
    match status.status {
        SessionStatus::Completed => status.archive_id.clone(),
        _ => None,
    }
}

async fn fingerprint(path: &Path, file_name: &str, file_size: u64) -> Result<String, UploadError> {
    let path = path.to_path_buf();
    let file_name = file_name.to_string();
    let fp = tokio::task::spawn_blocking(move || fingerprint_file(&path, &file_name, file_size)).await?;
    Ok(fp.to_string())
}
