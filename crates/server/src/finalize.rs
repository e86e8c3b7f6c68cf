//! Assembly, verification and registration of finished uploads.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use chunkdrop_protocol::types::{SessionStatus, UploadMetadata};
use chunkdrop_transfer::{Fingerprint, assemble_parts};

use crate::catalog::{ArchiveEntry, Catalog};
use crate::store::SessionStore;
use crate::{StoreError, join_error};

const ASSEMBLED_FILE: &str = "assembled.bin";

/// Turns a session whose chunks are all present into a catalog entry.
pub struct Finalizer {
    store: Arc<SessionStore>,
    catalog: Arc<dyn Catalog>,
}

impl Finalizer {
    pub fn new(store: Arc<SessionStore>, catalog: Arc<dyn Catalog>) -> Self {
        Self { store, catalog }
    }

    /// Assembles, verifies and registers `upload_id`, returning its archive id.
    ///
    /// Holds the session lock for the whole operation. `expected_hash` must
    /// equal the session's content hash. A session that is already
    /// `completed` returns its existing archive id. If the assembled bytes
    /// do not match, nothing is registered and the session is marked `failed`.
    pub async fn complete(
        &self,
        upload_id: &str,
        expected_hash: &str,
        metadata: &UploadMetadata,
    ) -> Result<String, StoreError> {
        let handle = self.store.handle(upload_id).await?;
        let mut record = handle.lock().await;

        // Content is verified against the key the session was opened with;
        // the caller's key only has to name the same content.
        let requested: Fingerprint = expected_hash.parse()?;
        let expected: Fingerprint = record.content_hash.parse()?;
        if requested != expected {
            warn!(
                upload_id,
                session = %expected,
                requested = %requested,
                "completion hash does not match the session"
            );
            return Err(StoreError::IntegrityMismatch {
                expected: expected.to_string(),
                actual: requested.to_string(),
            });
        }

        if record.status == SessionStatus::Completed
            && let Some(id) = &record.archive_id
        {
            info!(upload_id, archive_id = %id, "session already finalized");
            return Ok(id.clone());
        }

        if !record.is_complete() {
            return Err(StoreError::Incomplete {
                upload_id: upload_id.to_string(),
                missing: record.total_chunks - record.completed_chunks.len() as u32,
            });
        }

        let writer = self.store.chunk_writer(upload_id);
        let dest = self.store.session_dir(upload_id).join(ASSEMBLED_FILE);
        let total = record.total_chunks;
        let assembled = {
            let writer = writer.clone();
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || assemble_parts(&writer, total, &dest))
                .await
                .map_err(join_error)?
        };
        let assembled = match assembled {
            Ok(a) => a,
            Err(e) => {
                error!(upload_id, error = %e, "assembly failed");
                record.mark_failed(format!("assembly failed: {e}"));
                self.store.persist(&record).await?;
                return Err(e.into());
            }
        };

        let actual = Fingerprint::Sha256(assembled.digest.clone());
        let size_ok = assembled.size == record.file_size;
        let digest_ok = match expected.digest() {
            Some(hex) => hex == assembled.digest,
            None => {
                warn!(upload_id, "fallback content key, skipping digest verification");
                true
            }
        };
        if !size_ok || !digest_ok {
            let _ = tokio::fs::remove_file(&dest).await;
            error!(
                upload_id,
                expected = %expected,
                actual = %actual,
                size = assembled.size,
                "integrity check failed"
            );
            record.mark_failed("content hash mismatch");
            self.store.persist(&record).await?;
            return Err(StoreError::IntegrityMismatch {
                expected: expected.to_string(),
                actual: if size_ok {
                    actual.to_string()
                } else {
                    format!("{actual} ({} bytes)", assembled.size)
                },
            });
        }

        // Reserve the archive id durably before registering, so a retry
        // after a crash reuses it instead of creating a second artifact.
        let archive_id = match &record.archive_id {
            Some(id) => id.clone(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                record.archive_id = Some(id.clone());
                record.updated_at = Utc::now();
                self.store.persist(&record).await?;
                id
            }
        };

        let entry = ArchiveEntry {
            archive_id: archive_id.clone(),
            upload_id: upload_id.to_string(),
            file_name: record.file_name.clone(),
            file_size: record.file_size,
            content_hash: expected.to_string(),
            metadata: metadata.clone(),
            registered_at: Utc::now(),
        };
        let path = self.catalog.register(&entry, &dest).await?;

        record.status = SessionStatus::Completed;
        record.failure.clear();
        record.updated_at = Utc::now();
        self.store.persist(&record).await?;

        if let Err(e) = writer.remove_all() {
            warn!(upload_id, error = %e, "failed to remove chunk parts");
        }

        info!(
            upload_id,
            archive_id = %archive_id,
            size = assembled.size,
            path = %path.display(),
            "upload finalized"
        );
        Ok(archive_id)
    }
}
