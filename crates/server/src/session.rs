//! Persistent upload session record.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chunkdrop_protocol::messages::{InitSessionRequest, SessionStatusResponse};
use chunkdrop_protocol::types::SessionStatus;
use chunkdrop_transfer::{ChunkPlan, remaining};

use crate::StoreError;

/// File holding the record inside a session directory.
pub(crate) const RECORD_FILE: &str = "session.json";

/// Authoritative state of one upload, as stored in `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub completed_chunks: BTreeSet<u32>,
    pub status: SessionStatus,
    /// Reserved before catalog registration; stable once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Creates a `pending` record from an init request.
    pub fn new(req: &InitSessionRequest) -> Self {
        let now = Utc::now();
        Self {
            upload_id: req.upload_id.clone(),
            file_name: req.file_name.clone(),
            file_size: req.file_size,
            content_hash: req.content_hash.clone(),
            chunk_size: req.chunk_size,
            total_chunks: req.total_chunks,
            completed_chunks: BTreeSet::new(),
            status: SessionStatus::Pending,
            archive_id: None,
            failure: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if `req` describes the same upload as this record.
    pub fn matches(&self, req: &InitSessionRequest) -> bool {
        self.file_name == req.file_name
            && self.file_size == req.file_size
            && self.content_hash == req.content_hash
            && self.chunk_size == req.chunk_size
            && self.total_chunks == req.total_chunks
    }

    pub fn plan(&self) -> Result<ChunkPlan, StoreError> {
        Ok(ChunkPlan::new(self.file_size, self.chunk_size)?)
    }

    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() == self.total_chunks as usize
    }

    /// Indices not yet accepted, ascending.
    pub fn missing(&self) -> Vec<u32> {
        let done: Vec<u32> = self.completed_chunks.iter().copied().collect();
        remaining(self.total_chunks, &done)
    }

    /// Records `index` as accepted. Returns `true` if it was not already.
    ///
    /// Any accepted chunk moves a `pending` or `failed` session to `uploading`.
    pub fn mark_chunk(&mut self, index: u32) -> Result<bool, StoreError> {
        if index >= self.total_chunks {
            return Err(StoreError::OutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        let added = self.completed_chunks.insert(index);
        if matches!(self.status, SessionStatus::Pending | SessionStatus::Failed) {
            self.status = SessionStatus::Uploading;
            self.failure.clear();
        }
        self.updated_at = Utc::now();
        Ok(added)
    }

    /// Moves the session to `failed`, keeping its completed chunks.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.status != SessionStatus::Completed {
            self.status = SessionStatus::Failed;
            self.failure = reason.into();
            self.updated_at = Utc::now();
        }
    }

    pub fn to_status(&self) -> SessionStatusResponse {
        SessionStatusResponse {
            upload_id: self.upload_id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            content_hash: self.content_hash.clone(),
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            completed_chunks: self.completed_chunks.iter().copied().collect(),
            status: self.status,
            archive_id: self.archive_id.clone(),
        }
    }
}

/// Writes `record` to `<dir>/session.json` via temp file, fsync and rename.
pub(crate) fn write_record(dir: &Path, record: &SessionRecord) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;
    let json = serde_json::to_vec_pretty(record)?;
    let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, dir.join(RECORD_FILE))?;
    Ok(())
}

/// Reads `<dir>/session.json`.
pub(crate) fn read_record(dir: &Path) -> Result<SessionRecord, StoreError> {
    let data = std::fs::read(dir.join(RECORD_FILE))?;
    Ok(serde_json::from_slice(&data)?)
}
