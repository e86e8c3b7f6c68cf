//! Durable, authoritative session store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<upload_id>/session.json
//! <root>/<upload_id>/chunks/<index>.part
//! ```
//!
//! Each session sits behind its own mutex, so updates to one session never
//! wait on another. Chunk bytes are written outside that mutex; only the
//! set-insert and the record write happen inside it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use chunkdrop_protocol::constants::MAX_CHUNK_SIZE;
use chunkdrop_protocol::messages::{InitSessionRequest, SessionStatusResponse};
use chunkdrop_protocol::types::SessionStatus;
use chunkdrop_transfer::{
    ChunkPlan, ChunkWriter, Fingerprint, validate_file_name, validate_upload_id,
};

use crate::session::{RECORD_FILE, SessionRecord, read_record, write_record};
use crate::{StoreError, join_error};

type SessionHandle = Arc<Mutex<SessionRecord>>;

/// Outcome of [`SessionStore::mark_chunk_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMark {
    /// `false` if the index had already been recorded.
    pub newly_added: bool,
    pub completed_count: u32,
    pub status: SessionStatus,
}

/// Authoritative store of upload sessions.
pub struct SessionStore {
    root: PathBuf,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    /// Opens the store rooted at `root`, reloading every persisted session.
    ///
    /// Unreadable records are skipped with a warning. Directories with no
    /// record at all are removed.
    pub async fn load(root: &Path) -> Result<Self, StoreError> {
        let dir = root.to_path_buf();
        let records = tokio::task::spawn_blocking(move || load_records(&dir))
            .await
            .map_err(join_error)??;

        info!(root = %root.display(), sessions = records.len(), "session store loaded");

        let sessions = records
            .into_iter()
            .map(|r| (r.upload_id.clone(), Arc::new(Mutex::new(r))))
            .collect();
        Ok(Self {
            root: root.to_path_buf(),
            sessions: RwLock::new(sessions),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(upload_id)
    }

    /// Writer for the chunk parts of `upload_id`.
    pub fn chunk_writer(&self, upload_id: &str) -> ChunkWriter {
        ChunkWriter::new(&self.session_dir(upload_id).join("chunks"))
    }

    /// Opens a session.
    ///
    /// Re-opening an existing id with identical parameters is a no-op and
    /// returns `created == false`; different parameters are a conflict.
    pub async fn open(&self, req: &InitSessionRequest) -> Result<(SessionRecord, bool), StoreError> {
        validate_upload_id(&req.upload_id)?;
        validate_file_name(&req.file_name)?;
        req.content_hash.parse::<Fingerprint>()?;

        if req.chunk_size > MAX_CHUNK_SIZE {
            return Err(StoreError::Invalid(format!(
                "chunkSize {} exceeds the {MAX_CHUNK_SIZE}-byte limit",
                req.chunk_size
            )));
        }
        let plan = ChunkPlan::new(req.file_size, req.chunk_size)?;
        if plan.total_chunks() != req.total_chunks {
            return Err(StoreError::Invalid(format!(
                "totalChunks {} does not match {} bytes in {}-byte chunks ({})",
                req.total_chunks,
                req.file_size,
                req.chunk_size,
                plan.total_chunks()
            )));
        }

        loop {
            if let Ok(handle) = self.handle(&req.upload_id).await {
                let record = handle.lock().await;
                if !self.is_registered(&req.upload_id, &handle).await {
                    // Creation of this id failed while we waited.
                    continue;
                }
                if !record.matches(req) {
                    warn!(upload_id = %req.upload_id, "session parameters conflict");
                    return Err(StoreError::Conflict(req.upload_id.clone()));
                }
                debug!(upload_id = %req.upload_id, "session re-opened");
                return Ok((record.clone(), false));
            }

            let handle: SessionHandle = Arc::new(Mutex::new(SessionRecord::new(req)));
            // Held until the record is on disk, so concurrent openers and
            // chunk writers of this id wait for it.
            let record = handle.lock().await;
            {
                let mut sessions = self.sessions.write().await;
                if sessions.contains_key(&req.upload_id) {
                    continue;
                }
                sessions.insert(req.upload_id.clone(), Arc::clone(&handle));
            }

            if let Err(e) = self.persist(&record).await {
                let mut sessions = self.sessions.write().await;
                if sessions
                    .get(&req.upload_id)
                    .is_some_and(|h| Arc::ptr_eq(h, &handle))
                {
                    sessions.remove(&req.upload_id);
                }
                return Err(e);
            }

            info!(
                upload_id = %record.upload_id,
                file = %record.file_name,
                size = record.file_size,
                chunks = record.total_chunks,
                "session opened"
            );
            return Ok((record.clone(), true));
        }
    }

    /// Checks that chunk `index` of `len` bytes may be stored.
    ///
    /// Returns `None` if the index is already recorded, meaning the bytes
    /// must not be written again.
    pub async fn admit_chunk(
        &self,
        upload_id: &str,
        index: u32,
        total_chunks: u32,
        len: u64,
    ) -> Result<Option<ChunkWriter>, StoreError> {
        let handle = self.handle(upload_id).await?;
        let record = handle.lock().await;

        if total_chunks != record.total_chunks {
            return Err(StoreError::Invalid(format!(
                "totalChunks {total_chunks} does not match session ({})",
                record.total_chunks
            )));
        }
        if index >= record.total_chunks {
            return Err(StoreError::OutOfRange {
                index,
                total: record.total_chunks,
            });
        }
        if record.completed_chunks.contains(&index) {
            return Ok(None);
        }

        let expected = record.plan()?.len_of(index);
        if len != expected {
            return Err(StoreError::Invalid(format!(
                "chunk {index} has {len} bytes, expected {expected}"
            )));
        }
        Ok(Some(self.chunk_writer(upload_id)))
    }

    /// Records chunk `index` as accepted and persists before returning.
    ///
    /// Idempotent: an index already recorded changes nothing.
    pub async fn mark_chunk_complete(&self, upload_id: &str, index: u32) -> Result<ChunkMark, StoreError> {
        let handle = self.handle(upload_id).await?;
        let mut record = handle.lock().await;

        let before = record.clone();
        let newly_added = record.mark_chunk(index)?;
        if record.status != before.status || newly_added {
            if let Err(e) = self.persist(&record).await {
                *record = before;
                return Err(e);
            }
        }

        debug!(
            upload_id,
            index,
            newly_added,
            completed = record.completed_chunks.len(),
            total = record.total_chunks,
            "chunk recorded"
        );
        Ok(ChunkMark {
            newly_added,
            completed_count: record.completed_chunks.len() as u32,
            status: record.status,
        })
    }

    /// Moves the session to `failed`, keeping its completed set.
    pub async fn mark_failed(&self, upload_id: &str, reason: &str) -> Result<(), StoreError> {
        let handle = self.handle(upload_id).await?;
        let mut record = handle.lock().await;
        record.mark_failed(reason);
        self.persist(&record).await?;
        warn!(upload_id, reason, "session marked failed");
        Ok(())
    }

    pub async fn status(&self, upload_id: &str) -> Result<SessionStatusResponse, StoreError> {
        let handle = self.handle(upload_id).await?;
        let record = handle.lock().await;
        Ok(record.to_status())
    }

    /// Removes the session and everything stored for it.
    ///
    /// Returns `false` if no such session existed.
    pub async fn close(&self, upload_id: &str) -> Result<bool, StoreError> {
        let removed = self.sessions.write().await.remove(upload_id);
        let Some(handle) = removed else {
            return Ok(false);
        };
        // Wait for any in-progress update before deleting files.
        let _record = handle.lock().await;

        let dir = self.session_dir(upload_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(upload_id, "session closed");
        Ok(true)
    }

    /// Returns the lockable record for `upload_id`.
    pub(crate) async fn handle(&self, upload_id: &str) -> Result<SessionHandle, StoreError> {
        self.sessions
            .read()
            .await
            .get(upload_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))
    }

    async fn is_registered(&self, upload_id: &str, handle: &SessionHandle) -> bool {
        self.sessions
            .read()
            .await
            .get(upload_id)
            .is_some_and(|h| Arc::ptr_eq(h, handle))
    }

    /// Deletes chunk `index` of a session that was closed while the chunk
    /// was being written, along with the directories it re-created.
    ///
    /// Does nothing if a session with this id is registered again.
    pub async fn discard_orphan_part(&self, upload_id: &str, index: u32) -> Result<(), StoreError> {
        if self.sessions.read().await.contains_key(upload_id) {
            return Ok(());
        }
        let writer = self.chunk_writer(upload_id);
        let part = writer.part_path(index);
        let chunks = writer.dir().to_path_buf();
        let session = self.session_dir(upload_id);
        tokio::task::spawn_blocking(move || remove_orphan(&part, &chunks, &session))
            .await
            .map_err(join_error)??;
        debug!(upload_id, index, "orphaned chunk discarded");
        Ok(())
    }

    /// Writes `record` durably.
    pub(crate) async fn persist(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let dir = self.session_dir(&record.upload_id);
        let snapshot = record.clone();
        tokio::task::spawn_blocking(move || write_record(&dir, &snapshot))
            .await
            .map_err(join_error)?
    }
}

fn remove_orphan(part: &Path, chunks: &Path, session: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(part) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    // remove_dir only succeeds on empty directories.
    let _ = std::fs::remove_dir(chunks);
    let _ = std::fs::remove_dir(session);
    Ok(())
}

fn load_records(root: &Path) -> Result<Vec<SessionRecord>, StoreError> {
    std::fs::create_dir_all(root)?;
    let mut records = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if !path.join(RECORD_FILE).is_file() {
            // Left behind by a close racing a chunk write, or a crash
            // before the first record write.
            match std::fs::remove_dir_all(&path) {
                Ok(()) => info!(path = %path.display(), "removed session directory without a record"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphaned session directory"),
            }
            continue;
        }
        match read_record(&path) {
            Ok(record) => {
                let name_matches = path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy() == record.upload_id);
                if name_matches {
                    records.push(record);
                } else {
                    warn!(path = %path.display(), "session directory does not match its record, skipping");
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "unreadable session record, skipping"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn init(id: &str, file_size: u64, chunk_size: u64) -> InitSessionRequest {
        InitSessionRequest {
            upload_id: id.into(),
            file_name: "a.bin".into(),
            file_size,
            content_hash: format!("sha256:{}", "0".repeat(64)),
            total_chunks: file_size.div_ceil(chunk_size) as u32,
            chunk_size,
        }
    }

    async fn store(dir: &TempDir) -> SessionStore {
        SessionStore::load(&dir.path().join("sessions")).await.unwrap()
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let (r1, created) = store.open(&init("u1", 10, 4)).await.unwrap();
        assert!(created);
        assert_eq!(r1.total_chunks, 3);

        let (r2, created) = store.open(&init("u1", 10, 4)).await.unwrap();
        assert!(!created);
        assert_eq!(r2.upload_id, "u1");
        assert!(dir.path().join("sessions/u1/session.json").is_file());
    }

    #[tokio::test]
    async fn open_conflict() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.open(&init("u1", 10, 4)).await.unwrap();

        let result = store.open(&init("u1", 12, 4)).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn open_rejects_inconsistent_total() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let mut req = init("u1", 10, 4);
        req.total_chunks = 5;
        assert!(matches!(store.open(&req).await, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn open_rejects_oversized_chunks() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let req = init("u1", 4 * MAX_CHUNK_SIZE, 2 * MAX_CHUNK_SIZE);
        let err = store.open(&req).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(err.code(), 400);
        assert!(!dir.path().join("sessions/u1").exists());

        store
            .open(&init("u2", 2 * MAX_CHUNK_SIZE, MAX_CHUNK_SIZE))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_does_not_block_other_sessions() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir).await);
        store.open(&init("u1", 10, 4)).await.unwrap();
        store.open(&init("u2", 10, 4)).await.unwrap();

        let handle = store.handle("u1").await.unwrap();
        let held = handle.lock().await;

        let reopen = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.open(&init("u1", 10, 4)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let other = tokio::time::timeout(Duration::from_secs(2), store.status("u2")).await;
        assert!(other.expect("status of u2 stalled").is_ok());
        let created = tokio::time::timeout(
            Duration::from_secs(2),
            store.open(&init("u3", 10, 4)),
        )
        .await;
        assert!(created.expect("open of u3 stalled").unwrap().1);

        drop(held);
        let (_, created) = reopen.await.unwrap().unwrap();
        assert!(!created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_create_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir).await);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.open(&init("u1", 10, 4)).await.unwrap().1 })
            })
            .collect();
        let mut created = 0;
        for t in tasks {
            if t.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert!(dir.path().join("sessions/u1/session.json").is_file());
    }

    #[tokio::test]
    async fn discard_orphan_part_after_close() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.open(&init("u1", 10, 4)).await.unwrap();
        let writer = store.admit_chunk("u1", 0, 3, 4).await.unwrap().unwrap();

        assert!(store.close("u1").await.unwrap());
        // The write lands after close removed the directory.
        writer.write_chunk(0, b"abcd", "").unwrap();
        assert!(dir.path().join("sessions/u1/chunks/0.part").is_file());

        store.discard_orphan_part("u1", 0).await.unwrap();
        assert!(!dir.path().join("sessions/u1").exists());
    }

    #[tokio::test]
    async fn discard_orphan_part_spares_a_reopened_session() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.open(&init("u1", 10, 4)).await.unwrap();
        store.chunk_writer("u1").write_chunk(0, b"abcd", "").unwrap();

        store.discard_orphan_part("u1", 0).await.unwrap();
        assert!(dir.path().join("sessions/u1/chunks/0.part").is_file());
        assert!(dir.path().join("sessions/u1/session.json").is_file());
    }

    #[tokio::test]
    async fn open_rejects_bad_ids_and_names() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let bad_id = init("../escape", 10, 4);
        assert_eq!(store.open(&bad_id).await.unwrap_err().code(), 400);

        let mut bad_name = init("u1", 10, 4);
        bad_name.file_name = "../../passwd".into();
        assert_eq!(store.open(&bad_name).await.unwrap_err().code(), 400);

        let mut bad_hash = init("u1", 10, 4);
        bad_hash.content_hash = "md5:abc".into();
        assert_eq!(store.open(&bad_hash).await.unwrap_err().code(), 400);
    }

    #[tokio::test]
    async fn mark_chunk_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.open(&init("u1", 10, 4)).await.unwrap();

        let m1 = store.mark_chunk_complete("u1", 1).await.unwrap();
        assert!(m1.newly_added);
        assert_eq!(m1.completed_count, 1);
        assert_eq!(m1.status, SessionStatus::Uploading);

        let m2 = store.mark_chunk_complete("u1", 1).await.unwrap();
        assert!(!m2.newly_added);
        assert_eq!(m2.completed_count, 1);

        let status = store.status("u1").await.unwrap();
        assert_eq!(status.completed_chunks, vec![1]);
    }

    #[tokio::test]
    async fn mark_chunk_errors() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.open(&init("u1", 10, 4)).await.unwrap();

        assert!(matches!(
            store.mark_chunk_complete("nope", 0).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.mark_chunk_complete("u1", 3).await,
            Err(StoreError::OutOfRange { index: 3, total: 3 })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_marks_on_one_session() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir).await);
        store.open(&init("u1", 64, 1)).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..64u32 {
            // Every index marked twice from different tasks.
            for _ in 0..2 {
                let store = Arc::clone(&store);
                tasks.push(tokio::spawn(async move {
                    store.mark_chunk_complete("u1", i).await.unwrap()
                }));
            }
        }
        let mut newly = 0;
        for t in tasks {
            if t.await.unwrap().newly_added {
                newly += 1;
            }
        }
        assert_eq!(newly, 64);
        assert_eq!(store.status("u1").await.unwrap().completed_chunks.len(), 64);
    }

    #[tokio::test]
    async fn admit_chunk_checks() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.open(&init("u1", 10, 4)).await.unwrap();

        assert!(store.admit_chunk("u1", 0, 3, 4).await.unwrap().is_some());
        assert!(store.admit_chunk("u1", 2, 3, 2).await.unwrap().is_some());
        assert!(matches!(
            store.admit_chunk("u1", 2, 3, 4).await,
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            store.admit_chunk("u1", 0, 4, 4).await,
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            store.admit_chunk("u1", 7, 3, 4).await,
            Err(StoreError::OutOfRange { .. })
        ));

        store.mark_chunk_complete("u1", 0).await.unwrap();
        assert!(store.admit_chunk("u1", 0, 3, 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sessions_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let store = store(&dir).await;
            store.open(&init("u1", 10, 4)).await.unwrap();
            store.open(&init("u2", 8, 4)).await.unwrap();
            store.mark_chunk_complete("u1", 0).await.unwrap();
            store.mark_chunk_complete("u1", 2).await.unwrap();
            store.mark_failed("u2", "disk full").await.unwrap();
        }

        let store = store(&dir).await;
        let s1 = store.status("u1").await.unwrap();
        assert_eq!(s1.completed_chunks, vec![0, 2]);
        assert_eq!(s1.status, SessionStatus::Uploading);
        assert_eq!(
            store.status("u2").await.unwrap().status,
            SessionStatus::Failed
        );
    }

    #[tokio::test]
    async fn load_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("sessions");
        std::fs::create_dir_all(root.join("broken")).unwrap();
        std::fs::write(root.join("broken/session.json"), b"{not json").unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::create_dir_all(root.join("orphan/chunks")).unwrap();
        std::fs::write(root.join("orphan/chunks/0.part"), b"abcd").unwrap();

        let store = SessionStore::load(&root).await.unwrap();
        assert!(matches!(
            store.status("broken").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(root.join("broken/session.json").is_file());
        assert!(!root.join("empty").exists());
        assert!(!root.join("orphan").exists());
    }

    #[tokio::test]
    async fn close_removes_everything() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.open(&init("u1", 10, 4)).await.unwrap();
        store
            .chunk_writer("u1")
            .write_chunk(0, b"abcd", "")
            .unwrap();

        assert!(store.close("u1").await.unwrap());
        assert!(!dir.path().join("sessions/u1").exists());
        assert!(matches!(
            store.status("u1").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!store.close("u1").await.unwrap());
    }
}
