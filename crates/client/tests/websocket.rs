//! Uploads over a real WebSocket connection to a local server.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chunkdrop_client::{
    LocalMirror, RetryPolicy, UploadConfig, UploadError, UploadEvent, UploadRequest, Uploader,
    WsClient,
};
use chunkdrop_protocol::types::{SessionStatus, UploadMetadata};
use chunkdrop_server::{CatalogEvent, ServerConfig, UploadServer, UploadService};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestServer {
    dir: tempfile::TempDir,
    server: Arc<UploadServer<UploadService>>,
    handle: JoinHandle<()>,
    catalog_events: mpsc::Receiver<CatalogEvent>,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let (service, catalog_events) = UploadService::open_data_dir(&dir.path().join("data"))
            .await
            .unwrap();
        let config = ServerConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        };
        let server = UploadServer::bind(config, Arc::new(service)).await.unwrap();
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            runner.run().await.unwrap();
        });
        Self {
            dir,
            server,
            handle,
            catalog_events,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.server.local_addr())
    }

    async fn client(&self) -> Arc<WsClient> {
        let client = WsClient::connect(&self.url())
            .await
            .unwrap()
            .with_timeouts(Duration::from_secs(10), Duration::from_secs(30));
        Arc::new(client)
    }

    async fn stop(self) {
        self.server.shutdown();
        self.handle.await.unwrap();
    }
}

fn config() -> UploadConfig {
    UploadConfig {
        chunk_size: 64 * 1024,
        concurrency: 4,
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        },
        chunk_timeout: Duration::from_secs(30),
        request_timeout: Duration::from_secs(10),
    }
}

fn write_source(dir: &std::path::Path, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8 ^ (i >> 8) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &content).unwrap();
    (path, content)
}

#[tokio::test]
async fn upload_over_websocket() {
    let mut srv = TestServer::start().await;
    let (path, content) = write_source(srv.dir.path(), "volume-01.cbz", 1_000_000);

    let mut uploader = Uploader::new(srv.client().await, config());
    let mut events = uploader.take_events().unwrap();
    let meta = UploadMetadata {
        title: "Volume 1".into(),
        tags: vec!["manga".into()],
        summary: "First volume".into(),
        category: "comics".into(),
    };
    let outcome = uploader
        .upload(&UploadRequest::new(&path).with_metadata(meta), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.file_size, 1_000_000);
    assert_eq!(outcome.total_chunks, 16);
    assert_eq!(outcome.chunks_sent, 16);
    assert!(!outcome.resumed);

    let mut completed = None;
    while let Ok(e) = events.try_recv() {
        if let UploadEvent::Completed { archive_id, .. } = e {
            completed = Some(archive_id);
        }
    }
    assert_eq!(completed.as_deref(), Some(outcome.archive_id.as_str()));

    let CatalogEvent::Registered {
        archive_id,
        metadata,
        path: stored,
        ..
    } = tokio::time::timeout(Duration::from_secs(5), srv.catalog_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archive_id, outcome.archive_id);
    assert_eq!(metadata.title, "Volume 1");
    assert_eq!(metadata.category, "comics");
    assert_eq!(std::fs::read(stored).unwrap(), content);

    let progress = uploader.status(&outcome.upload_id).await.unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.completed_chunks, 16);
    assert!((progress.percentage() - 100.0).abs() < 1e-9);

    drop(uploader);
    srv.stop().await;
}

#[tokio::test]
async fn resume_over_a_new_connection() {
    let srv = TestServer::start().await;
    let (path, content) = write_source(srv.dir.path(), "resume.bin", 300_000);
    let mirror = LocalMirror::new(srv.dir.path().join("mirror"));

    // Cancelled before the first batch: the session exists but holds nothing.
    let first = Uploader::new(srv.client().await, config()).with_mirror(mirror.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = first
        .upload(&UploadRequest::new(&path), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Cancelled));
    drop(first);

    let upload_id = mirror.find_resumable(&path, 300_000).unwrap().upload_id;

    let second = Uploader::new(srv.client().await, config()).with_mirror(mirror.clone());
    let progress = second.status(&upload_id).await.unwrap();
    assert_eq!(progress.completed_chunks, 0);
    assert_eq!(progress.total_chunks, 5);

    let outcome = second
        .upload(&UploadRequest::new(&path), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.upload_id, upload_id);
    assert!(outcome.resumed);
    assert_eq!(outcome.chunks_sent, 5);
    assert!(mirror.load(&upload_id).is_none());

    let stored = srv
        .dir
        .path()
        .join("data")
        .join("archives")
        .join(&outcome.archive_id)
        .join("resume.bin");
    assert_eq!(std::fs::read(stored).unwrap(), content);

    // Finalized sessions answer a repeated upload without sending chunks.
    let again = second
        .upload(&UploadRequest::new(&path).resume(&upload_id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.archive_id, outcome.archive_id);
    assert_eq!(again.chunks_sent, 0);

    drop(second);
    srv.stop().await;
}

#[tokio::test]
async fn cancel_over_websocket() {
    let srv = TestServer::start().await;
    let (path, _) = write_source(srv.dir.path(), "gone.bin", 10_000);
    let mirror = LocalMirror::new(srv.dir.path().join("mirror"));

    let uploader = Uploader::new(srv.client().await, config()).with_mirror(mirror.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();
    uploader
        .upload(&UploadRequest::new(&path), cancel)
        .await
        .unwrap_err();
    let upload_id = mirror.find_resumable(&path, 10_000).unwrap().upload_id;

    assert!(uploader.cancel(&upload_id).await.unwrap().success);
    assert!(matches!(
        uploader.status(&upload_id).await,
        Err(UploadError::NotFound(_))
    ));
    assert!(mirror.entries().is_empty());

    drop(uploader);
    srv.stop().await;
}

async fn wait_until_disconnected(client: &WsClient) {
    for _ in 0..200 {
        if !client.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client still connected");
}

#[tokio::test]
async fn requests_reconnect_after_the_server_drops_the_connection() {
    let srv = TestServer::start().await;
    let (path, content) = write_source(srv.dir.path(), "after-drop.bin", 200_000);
    let client = srv.client().await;

    assert_eq!(srv.server.disconnect_all().await, 1);
    wait_until_disconnected(&client).await;

    let uploader = Uploader::new(client.clone(), config());
    let outcome = uploader
        .upload(&UploadRequest::new(&path), CancellationToken::new())
        .await
        .unwrap();
    assert!(client.is_connected());

    let stored = srv
        .dir
        .path()
        .join("data")
        .join("archives")
        .join(&outcome.archive_id)
        .join("after-drop.bin");
    assert_eq!(std::fs::read(stored).unwrap(), content);

    drop(uploader);
    srv.stop().await;
}

#[tokio::test]
async fn upload_survives_a_dropped_connection_mid_transfer() {
    let srv = TestServer::start().await;
    let (path, content) = write_source(srv.dir.path(), "long.bin", 4 * 1024 * 1024);

    let mut uploader = Uploader::new(srv.client().await, config());
    let mut events = uploader.take_events().unwrap();

    // Drop every connection once the first batch has been acknowledged.
    let server = Arc::clone(&srv.server);
    let dropper = tokio::spawn(async move {
        let mut dropped = 0;
        while let Some(event) = events.recv().await {
            if dropped == 0 && matches!(event, UploadEvent::Progress { .. }) {
                dropped = server.disconnect_all().await;
            }
        }
        dropped
    });

    let outcome = uploader
        .upload(&UploadRequest::new(&path), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.total_chunks, 64);

    drop(uploader);
    assert_eq!(dropper.await.unwrap(), 1);

    let progress = Uploader::new(srv.client().await, config())
        .status(&outcome.upload_id)
        .await
        .unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);

    let stored = srv
        .dir
        .path()
        .join("data")
        .join("archives")
        .join(&outcome.archive_id)
        .join("long.bin");
    assert_eq!(std::fs::read(stored).unwrap(), content);

    srv.stop().await;
}
