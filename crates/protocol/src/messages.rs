use serde::{Deserialize, Serialize};

use crate::types::{SessionStatus, UploadMetadata};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens (or re-opens) an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionRequest {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

/// Asks for the authoritative state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub upload_id: String,
}

/// Asks the receiving side to assemble, verify and register the upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub upload_id: String,
    pub content_hash: String,
    #[serde(default)]
    pub metadata: UploadMetadata,
}

/// Discards a session and every chunk accepted for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub upload_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Reply to `init_session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionResponse {
    pub upload_id: String,
    /// `false` when the session already existed with matching parameters.
    pub created: bool,
    pub status: SessionStatus,
    #[serde(default)]
    pub completed_chunks: Vec<u32>,
}

/// Acknowledgement for one chunk frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub upload_id: String,
    pub index: u32,
    /// The index had been accepted earlier; this frame changed nothing.
    #[serde(default)]
    pub already_complete: bool,
    pub completed_count: u32,
    pub status: SessionStatus,
}

/// Authoritative state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// Content hash the session was opened with.
    pub content_hash: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    /// Sorted ascending, no duplicates.
    pub completed_chunks: Vec<u32>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<String>,
}

/// Reply to `complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub upload_id: String,
    pub archive_id: String,
}

/// Generic result of an operation without a specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}
