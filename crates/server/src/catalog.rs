//! Artifact catalog: where finished uploads are registered.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use chunkdrop_protocol::types::UploadMetadata;

use crate::{StoreError, join_error};

const METADATA_FILE: &str = "metadata.json";

/// A boxed future returned by catalog methods.
pub type CatalogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Catalog entry for one registered artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub archive_id: String,
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: String,
    pub metadata: UploadMetadata,
    pub registered_at: DateTime<Utc>,
}

/// Notification sent to downstream processing.
#[derive(Debug, Clone)]
pub enum CatalogEvent {
    Registered {
        archive_id: String,
        upload_id: String,
        metadata: UploadMetadata,
        path: PathBuf,
    },
}

/// Destination for verified uploads.
///
/// `register` must be idempotent per `archive_id`: registering an id that
/// is already present leaves the existing artifact untouched.
pub trait Catalog: Send + Sync + 'static {
    /// Moves `content` into the catalog under `entry.archive_id`.
    /// Returns the artifact's final path.
    fn register<'a>(&'a self, entry: &'a ArchiveEntry, content: &'a Path) -> CatalogFuture<'a, PathBuf>;

    /// Returns `true` if `archive_id` is registered.
    fn contains<'a>(&'a self, archive_id: &'a str) -> CatalogFuture<'a, bool>;
}

/// Catalog on the local filesystem.
///
/// Layout: `<root>/<archive_id>/<file_name>` plus `metadata.json`, which is
/// written last and marks the entry as registered.
pub struct FsCatalog {
    root: PathBuf,
    events_tx: mpsc::Sender<CatalogEvent>,
    events_rx: Option<mpsc::Receiver<CatalogEvent>>,
}

impl FsCatalog {
    pub fn new(root: &Path) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            root: root.to_path_buf(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<CatalogEvent>> {
        self.events_rx.take()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads the entry for `archive_id`, if registered.
    pub async fn entry(&self, archive_id: &str) -> Result<Option<ArchiveEntry>, StoreError> {
        match tokio::fs::read(self.root.join(archive_id).join(METADATA_FILE)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of registered archives.
    pub async fn len(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if entry.path().join(METADATA_FILE).is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}

impl Catalog for FsCatalog {
    fn register<'a>(&'a self, entry: &'a ArchiveEntry, content: &'a Path) -> CatalogFuture<'a, PathBuf> {
        Box::pin(async move {
            let dir = self.root.join(&entry.archive_id);
            let target = dir.join(&entry.file_name);

            if dir.join(METADATA_FILE).is_file() {
                info!(archive_id = %entry.archive_id, "archive already registered");
                let _ = tokio::fs::remove_file(content).await;
                return Ok(target);
            }

            let entry_owned = entry.clone();
            let content_owned = content.to_path_buf();
            let target_owned = target.clone();
            tokio::task::spawn_blocking(move || {
                store_entry(&dir, &entry_owned, &content_owned, &target_owned)
            })
            .await
            .map_err(join_error)??;

            info!(
                archive_id = %entry.archive_id,
                upload_id = %entry.upload_id,
                path = %target.display(),
                "archive registered"
            );

            let event = CatalogEvent::Registered {
                archive_id: entry.archive_id.clone(),
                upload_id: entry.upload_id.clone(),
                metadata: entry.metadata.clone(),
                path: target.clone(),
            };
            if self.events_tx.try_send(event).is_err() {
                warn!(archive_id = %entry.archive_id, "catalog event dropped, receiver full or closed");
            }
            Ok(target)
        })
    }

    fn contains<'a>(&'a self, archive_id: &'a str) -> CatalogFuture<'a, bool> {
        Box::pin(async move { Ok(self.root.join(archive_id).join(METADATA_FILE).is_file()) })
    }
}

fn store_entry(dir: &Path, entry: &ArchiveEntry, content: &Path, target: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;

    // A retry after a crash may find the content already moved.
    if content.exists() {
        if std::fs::rename(content, target).is_err() {
            std::fs::copy(content, target)?;
            std::fs::remove_file(content)?;
        }
    } else if !target.is_file() {
        return Err(StoreError::Catalog(format!(
            "assembled content missing: {}",
            content.display()
        )));
    }

    let json = serde_json::to_vec_pretty(entry)?;
    let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, dir.join(METADATA_FILE))?;
    Ok(())
}
