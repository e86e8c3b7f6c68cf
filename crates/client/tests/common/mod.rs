//! In-process transport over the real receiving service.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkdrop_client::{RetryPolicy, TransportError, TransportFuture, UploadConfig, UploadTransport};
use chunkdrop_protocol::frame::ChunkHeader;
use chunkdrop_protocol::messages::{
    ChunkAck, CompleteRequest, CompleteResponse, InitSessionRequest, InitSessionResponse,
    OperationResult, SessionStatusResponse,
};
use chunkdrop_server::{CatalogEvent, StoreError, UploadService};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn server_error(e: StoreError) -> TransportError {
    TransportError::Server {
        code: e.code(),
        message: e.to_string(),
    }
}

/// Calls [`UploadService`] directly, with injectable chunk failures.
pub struct LocalTransport {
    service: Arc<UploadService>,
    /// Remaining injected failures per chunk index.
    faults: Mutex<HashMap<u32, u32>>,
    sent: Mutex<Vec<u32>>,
    /// Cancels the token once the server holds this many chunks.
    cancel_at: Mutex<Option<(u32, CancellationToken)>>,
}

impl LocalTransport {
    pub fn new(service: Arc<UploadService>) -> Self {
        Self {
            service,
            faults: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            cancel_at: Mutex::new(None),
        }
    }

    pub fn fail_times(&self, index: u32, times: u32) {
        self.faults.lock().unwrap().insert(index, times);
    }

    pub fn cancel_when_completed(&self, count: u32, token: CancellationToken) {
        *self.cancel_at.lock().unwrap() = Some((count, token));
    }

    /// Chunk indices sent so far, including failed attempts.
    pub fn sent(&self) -> Vec<u32> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn sends_of(&self, index: u32) -> usize {
        self.sent().iter().filter(|&&i| i == index).count()
    }
}

impl UploadTransport for LocalTransport {
    fn init_session<'a>(&'a self, req: &'a InitSessionRequest) -> TransportFuture<'a, InitSessionResponse> {
        Box::pin(async move { self.service.init_session(req).await.map_err(server_error) })
    }

    fn put_chunk<'a>(&'a self, header: &'a ChunkHeader, data: &'a [u8]) -> TransportFuture<'a, ChunkAck> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(header.index);

            let inject = {
                let mut faults = self.faults.lock().unwrap();
                match faults.get_mut(&header.index) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if inject {
                return Err(TransportError::Timeout);
            }

            let ack = self
                .service
                .put_chunk(header, data.to_vec())
                .await
                .map_err(server_error)?;

            if let Some((count, token)) = self.cancel_at.lock().unwrap().as_ref()
                && ack.completed_count >= *count
            {
                token.cancel();
            }
            Ok(ack)
        })
    }

    fn get_status<'a>(&'a self, upload_id: &'a str) -> TransportFuture<'a, SessionStatusResponse> {
        Box::pin(async move { self.service.status(upload_id).await.map_err(server_error) })
    }

    fn complete<'a>(&'a self, req: &'a CompleteRequest) -> TransportFuture<'a, CompleteResponse> {
        Box::pin(async move { self.service.complete(req).await.map_err(server_error) })
    }

    fn cancel<'a>(&'a self, upload_id: &'a str) -> TransportFuture<'a, OperationResult> {
        Box::pin(async move { self.service.cancel(upload_id).await.map_err(server_error) })
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub service: Arc<UploadService>,
    pub catalog_events: mpsc::Receiver<CatalogEvent>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let (service, catalog_events) = UploadService::open_data_dir(&dir.path().join("data"))
            .await
            .unwrap();
        Self {
            dir,
            service: Arc::new(service),
            catalog_events,
        }
    }

    pub fn transport(&self) -> Arc<LocalTransport> {
        Arc::new(LocalTransport::new(Arc::clone(&self.service)))
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.dir.path().join("mirror")
    }

    /// Writes `len` bytes of patterned content and returns its path.
    pub fn write_file(&self, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let content: Vec<u8> = (0..len).map(|i| (i * 31 % 253) as u8).collect();
        let path = self.dir.path().join(name);
        std::fs::write(&path, &content).unwrap();
        (path, content)
    }

    pub fn archive_path(&self, archive_id: &str, file_name: &str) -> PathBuf {
        self.dir
            .path()
            .join("data")
            .join("archives")
            .join(archive_id)
            .join(file_name)
    }
}

pub fn fast_config(chunk_size: u64) -> UploadConfig {
    UploadConfig {
        chunk_size,
        concurrency: 3,
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            ..RetryPolicy::default()
        },
        chunk_timeout: Duration::from_secs(10),
        request_timeout: Duration::from_secs(10),
    }
}

pub fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}
