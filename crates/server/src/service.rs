//! Upload protocol operations and their WebSocket bindings.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use chunkdrop_protocol::constants::{ERR_BAD_REQUEST, MessageType};
use chunkdrop_protocol::envelope::Message;
use chunkdrop_protocol::frame::ChunkHeader;
use chunkdrop_protocol::messages::{
    CancelRequest, ChunkAck, CompleteRequest, CompleteResponse, InitSessionRequest,
    InitSessionResponse, OperationResult, SessionStatusResponse, StatusRequest,
};
use chunkdrop_transfer::{TransferError, validate_upload_id};

use crate::catalog::{Catalog, CatalogEvent, FsCatalog};
use crate::connection::Sender;
use crate::finalize::Finalizer;
use crate::handler::{Handler, HandlerFuture};
use crate::store::SessionStore;
use crate::{StoreError, join_error};

/// The receiving side of the protocol: InitSession, PutChunk, GetStatus,
/// Complete and Cancel over one [`SessionStore`].
pub struct UploadService {
    store: Arc<SessionStore>,
    finalizer: Finalizer,
}

impl UploadService {
    pub fn new(store: Arc<SessionStore>, catalog: Arc<dyn Catalog>) -> Self {
        let finalizer = Finalizer::new(Arc::clone(&store), catalog);
        Self { store, finalizer }
    }

    /// Opens a service over `<data_dir>/sessions` and `<data_dir>/archives`,
    /// returning the receiver for catalog registrations.
    pub async fn open_data_dir(
        data_dir: &Path,
    ) -> Result<(Self, mpsc::Receiver<CatalogEvent>), StoreError> {
        let store = Arc::new(SessionStore::load(&data_dir.join("sessions")).await?);
        let mut catalog = FsCatalog::new(&data_dir.join("archives"));
        let events = catalog
            .take_events()
            .ok_or_else(|| StoreError::Catalog("event receiver already taken".into()))?;
        Ok((Self::new(store, Arc::new(catalog)), events))
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub async fn init_session(&self, req: &InitSessionRequest) -> Result<InitSessionResponse, StoreError> {
        let (record, created) = self.store.open(req).await?;
        Ok(InitSessionResponse {
            upload_id: record.upload_id.clone(),
            created,
            status: record.status,
            completed_chunks: record.completed_chunks.iter().copied().collect(),
        })
    }

    /// Stores one chunk and records it.
    ///
    /// An index that is already recorded is acknowledged without touching
    /// the stored bytes.
    pub async fn put_chunk(&self, header: &ChunkHeader, data: Vec<u8>) -> Result<ChunkAck, StoreError> {
        let upload_id = header.upload_id.as_str();
        validate_upload_id(upload_id)?;

        let admitted = self
            .store
            .admit_chunk(upload_id, header.index, header.total_chunks, data.len() as u64)
            .await?;

        let wrote = admitted.is_some();
        if let Some(writer) = admitted {
            let index = header.index;
            let checksum = header.checksum.clone();
            let written = tokio::task::spawn_blocking(move || writer.write_chunk(index, &data, &checksum))
                .await
                .map_err(join_error)?;
            match written {
                Ok(_) => {}
                Err(e @ TransferError::ChecksumMismatch { .. }) => {
                    warn!(upload_id, index, "chunk checksum mismatch");
                    return Err(e.into());
                }
                Err(e) => match self.store.mark_failed(upload_id, &e.to_string()).await {
                    Err(gone @ StoreError::NotFound(_)) => {
                        debug!(upload_id, index, "session closed during chunk write");
                        self.discard_orphan(upload_id, index).await;
                        return Err(gone);
                    }
                    marked => {
                        error!(upload_id, index, error = %e, "failed to store chunk");
                        if let Err(mark_err) = marked {
                            error!(upload_id, error = %mark_err, "failed to record session failure");
                        }
                        return Err(e.into());
                    }
                },
            }
        }

        let mark = match self.store.mark_chunk_complete(upload_id, header.index).await {
            Ok(mark) => mark,
            Err(e @ StoreError::NotFound(_)) if wrote => {
                debug!(upload_id, index = header.index, "session closed during chunk write");
                self.discard_orphan(upload_id, header.index).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        Ok(ChunkAck {
            upload_id: upload_id.to_string(),
            index: header.index,
            already_complete: !mark.newly_added,
            completed_count: mark.completed_count,
            status: mark.status,
        })
    }

    async fn discard_orphan(&self, upload_id: &str, index: u32) {
        if let Err(e) = self.store.discard_orphan_part(upload_id, index).await {
            warn!(upload_id, index, error = %e, "failed to discard orphaned chunk");
        }
    }

    pub async fn status(&self, upload_id: &str) -> Result<SessionStatusResponse, StoreError> {
        self.store.status(upload_id).await
    }

    pub async fn complete(&self, req: &CompleteRequest) -> Result<CompleteResponse, StoreError> {
        let archive_id = self
            .finalizer
            .complete(&req.upload_id, &req.content_hash, &req.metadata)
            .await?;
        Ok(CompleteResponse {
            upload_id: req.upload_id.clone(),
            archive_id,
        })
    }

    /// Deletes a session and its chunks. Unknown ids are not an error.
    pub async fn cancel(&self, upload_id: &str) -> Result<OperationResult, StoreError> {
        let removed = self.store.close(upload_id).await?;
        if removed {
            info!(upload_id, "upload cancelled");
        }
        Ok(OperationResult {
            success: true,
            message: if removed {
                String::new()
            } else {
                "no such session".into()
            },
        })
    }
}

// ---------------------------------------------------------------------------
// WebSocket bindings
// ---------------------------------------------------------------------------

/// Decodes the payload of `msg` or replies 400.
fn payload<T: for<'de> serde::Deserialize<'de>>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.parse_payload() {
        Ok(Some(p)) => Some(p),
        _ => {
            let _ = sender.send_error(msg, ERR_BAD_REQUEST, "invalid payload");
            None
        }
    }
}

/// Sends `result` as a reply of type `ok_type`, or as an error reply.
fn respond<T: serde::Serialize>(
    sender: &Sender,
    msg: &Message,
    ok_type: MessageType,
    result: Result<T, StoreError>,
) {
    match result {
        Ok(body) => match msg.reply(ok_type, Some(&body)) {
            Ok(reply) => {
                let _ = sender.send_msg(reply);
            }
            Err(e) => {
                error!("failed to encode reply: {e}");
            }
        },
        Err(e) => {
            debug!(id = %msg.id, code = e.code(), error = %e, "request failed");
            let _ = sender.send_error(msg, e.code(), &e.to_string());
        }
    }
}

impl Handler for UploadService {
    fn on_init_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = payload::<InitSessionRequest>(&sender, &msg) else {
                return;
            };
            let result = self.init_session(&req).await;
            respond(&sender, &msg, MessageType::SessionInitialized, result);
        })
    }

    fn on_get_status(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = payload::<StatusRequest>(&sender, &msg) else {
                return;
            };
            let result = self.status(&req.upload_id).await;
            respond(&sender, &msg, MessageType::SessionStatus, result);
        })
    }

    fn on_complete(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = payload::<CompleteRequest>(&sender, &msg) else {
                return;
            };
            let result = self.complete(&req).await;
            respond(&sender, &msg, MessageType::CompleteResult, result);
        })
    }

    fn on_cancel(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = payload::<CancelRequest>(&sender, &msg) else {
                return;
            };
            let result = self.cancel(&req.upload_id).await;
            respond(&sender, &msg, MessageType::OperationResult, result);
        })
    }

    fn on_chunk(&self, sender: Sender, header: ChunkHeader, data: Vec<u8>) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = self.put_chunk(&header, data).await;
            let req = Message::addressed_to(header.id.clone());
            respond(&sender, &req, MessageType::ChunkAck, result);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdrop_protocol::types::{SessionStatus, UploadMetadata};
    use chunkdrop_transfer::{ChunkPlan, Fingerprint, checksum_bytes};
    use tempfile::TempDir;

    const CONTENT: &[u8] = b"0123456789";

    async fn service(dir: &TempDir) -> (UploadService, mpsc::Receiver<CatalogEvent>) {
        UploadService::open_data_dir(dir.path()).await.unwrap()
    }

    fn init_req(id: &str) -> InitSessionRequest {
        InitSessionRequest {
            upload_id: id.into(),
            file_name: "digits.txt".into(),
            file_size: CONTENT.len() as u64,
            content_hash: Fingerprint::of_bytes(CONTENT).to_string(),
            total_chunks: 3,
            chunk_size: 4,
        }
    }

    fn chunk(id: &str, index: u32) -> (ChunkHeader, Vec<u8>) {
        let plan = ChunkPlan::new(CONTENT.len() as u64, 4).unwrap();
        let r = plan.range_of(index).unwrap();
        let data = CONTENT[r.start as usize..r.end as usize].to_vec();
        let header = ChunkHeader {
            id: format!("req-{index}"),
            upload_id: id.into(),
            index,
            total_chunks: 3,
            checksum: checksum_bytes(&data),
        };
        (header, data)
    }

    #[tokio::test]
    async fn full_upload_flow() {
        let dir = TempDir::new().unwrap();
        let (svc, mut events) = service(&dir).await;

        let init = svc.init_session(&init_req("u1")).await.unwrap();
        assert!(init.created);
        assert_eq!(init.status, SessionStatus::Pending);

        for i in [2, 0, 1] {
            let (h, d) = chunk("u1", i);
            let ack = svc.put_chunk(&h, d).await.unwrap();
            assert!(!ack.already_complete);
            assert_eq!(ack.status, SessionStatus::Uploading);
        }

        let status = svc.status("u1").await.unwrap();
        assert_eq!(status.completed_chunks, vec![0, 1, 2]);
        assert_eq!(status.status, SessionStatus::Uploading);

        let done = svc
            .complete(&CompleteRequest {
                upload_id: "u1".into(),
                content_hash: Fingerprint::of_bytes(CONTENT).to_string(),
                metadata: UploadMetadata::default(),
            })
            .await
            .unwrap();

        match events.try_recv().unwrap() {
            CatalogEvent::Registered {
                archive_id, upload_id, ..
            } => {
                assert_eq!(archive_id, done.archive_id);
                assert_eq!(upload_id, "u1");
            }
        }
    }

    #[tokio::test]
    async fn duplicate_chunk_is_acknowledged_once() {
        let dir = TempDir::new().unwrap();
        let (svc, _events) = service(&dir).await;
        svc.init_session(&init_req("u1")).await.unwrap();

        let (h, d) = chunk("u1", 1);
        let first = svc.put_chunk(&h, d.clone()).await.unwrap();
        let second = svc.put_chunk(&h, d).await.unwrap();
        assert!(!first.already_complete);
        assert!(second.already_complete);
        assert_eq!(second.completed_count, 1);
        assert_eq!(svc.status("u1").await.unwrap().completed_chunks, vec![1]);
    }

    #[tokio::test]
    async fn corrupted_chunk_is_retryable() {
        let dir = TempDir::new().unwrap();
        let (svc, _events) = service(&dir).await;
        svc.init_session(&init_req("u1")).await.unwrap();

        let (h, mut d) = chunk("u1", 0);
        d[0] ^= 0xff;
        let err = svc.put_chunk(&h, d).await.unwrap_err();
        assert_eq!(err.code(), 460);

        let status = svc.status("u1").await.unwrap();
        assert!(status.completed_chunks.is_empty());
        assert_eq!(status.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn validation_errors() {
        let dir = TempDir::new().unwrap();
        let (svc, _events) = service(&dir).await;
        svc.init_session(&init_req("u1")).await.unwrap();

        let (mut h, d) = chunk("u1", 0);
        h.index = 9;
        assert_eq!(svc.put_chunk(&h, d.clone()).await.unwrap_err().code(), 416);

        let (h, _) = chunk("u1", 0);
        assert_eq!(svc.put_chunk(&h, b"ab".to_vec()).await.unwrap_err().code(), 400);

        let (h, d) = chunk("missing", 0);
        assert_eq!(svc.put_chunk(&h, d).await.unwrap_err().code(), 404);

        let mut conflicting = init_req("u1");
        conflicting.file_name = "other.txt".into();
        assert_eq!(
            svc.init_session(&conflicting).await.unwrap_err().code(),
            409
        );
    }

    #[tokio::test]
    async fn storage_failure_marks_session_failed() {
        let dir = TempDir::new().unwrap();
        let (svc, _events) = service(&dir).await;
        svc.init_session(&init_req("u1")).await.unwrap();

        let (h, d) = chunk("u1", 0);
        svc.put_chunk(&h, d).await.unwrap();

        // A file where the chunk directory should be makes writes fail.
        let chunks_dir = svc.store().chunk_writer("u1").dir().to_path_buf();
        std::fs::remove_dir_all(&chunks_dir).unwrap();
        std::fs::write(&chunks_dir, b"").unwrap();

        let (h, d) = chunk("u1", 1);
        let err = svc.put_chunk(&h, d).await.unwrap_err();
        assert_eq!(err.code(), 500);

        let status = svc.status("u1").await.unwrap();
        assert_eq!(status.status, SessionStatus::Failed);
        assert_eq!(status.completed_chunks, vec![0]);

        // Storage recovers; the next accepted chunk resumes the session.
        std::fs::remove_file(&chunks_dir).unwrap();
        let (h, d) = chunk("u1", 1);
        svc.put_chunk(&h, d).await.unwrap();
        assert_eq!(
            svc.status("u1").await.unwrap().status,
            SessionStatus::Uploading
        );
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (svc, _events) = service(&dir).await;
        svc.init_session(&init_req("u1")).await.unwrap();

        let first = svc.cancel("u1").await.unwrap();
        assert!(first.success);
        assert!(first.message.is_empty());
        assert_eq!(svc.status("u1").await.unwrap_err().code(), 404);

        let second = svc.cancel("u1").await.unwrap();
        assert!(second.success);
        assert!(!second.message.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_during_chunk_write_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let (svc, _events) = service(&dir).await;
        let svc = Arc::new(svc);
        svc.init_session(&init_req("u1")).await.unwrap();

        // Queue the chunk and then the cancel behind a held session lock,
        // so the cancel runs between admission and recording.
        let handle = svc.store().handle("u1").await.unwrap();
        let held = handle.lock().await;
        let put = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move {
                let (h, d) = chunk("u1", 0);
                svc.put_chunk(&h, d).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let cancel = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.cancel("u1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(held);

        let err = put.await.unwrap().unwrap_err();
        assert_eq!(err.code(), 404);
        assert!(cancel.await.unwrap().unwrap().success);
        assert!(!dir.path().join("sessions/u1").exists());
    }

    #[tokio::test]
    async fn handler_replies_to_chunk_frames() {
        let dir = TempDir::new().unwrap();
        let (svc, _events) = service(&dir).await;
        svc.init_session(&init_req("u1")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let sender = Sender::for_test(tx);

        let (h, d) = chunk("u1", 2);
        svc.on_chunk(sender.clone(), h, d).await;
        let reply = rx.recv().await.unwrap();
        let msg: Message = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(msg.id, "req-2");
        assert_eq!(msg.msg_type, MessageType::ChunkAck);
        let ack: ChunkAck = msg.parse_payload().unwrap().unwrap();
        assert_eq!(ack.index, 2);

        let bad = Message::new("s1", MessageType::GetStatus, Some(&"not an object")).unwrap();
        svc.on_get_status(sender, bad).await;
        let reply = rx.recv().await.unwrap();
        let msg: Message = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(msg.error.unwrap().code, 400);
    }
}
