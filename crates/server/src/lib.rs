//! Receiving side of a chunkdrop upload.
//!
//! Keeps the authoritative record of every upload session on disk, accepts
//! chunks from any number of WebSocket clients, and assembles, verifies and
//! registers finished uploads exactly once.

mod catalog;
mod connection;
mod finalize;
mod handler;
mod server;
mod service;
mod session;
mod store;

pub use catalog::{ArchiveEntry, Catalog, CatalogEvent, CatalogFuture, FsCatalog};
pub use connection::{ClientConnection, SendError, Sender};
pub use finalize::Finalizer;
pub use handler::{Handler, HandlerFuture};
pub use server::{DEFAULT_PORT, ServerConfig, UploadServer};
pub use service::UploadService;
pub use session::SessionRecord;
pub use store::{ChunkMark, SessionStore};

use chunkdrop_protocol::constants::{
    ERR_BAD_REQUEST, ERR_CHUNK_CHECKSUM, ERR_CONFLICT, ERR_INCOMPLETE, ERR_INTEGRITY,
    ERR_INTERNAL, ERR_NOT_FOUND, ERR_OUT_OF_RANGE,
};
use chunkdrop_transfer::TransferError;

/// Send buffer capacity per connection.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the WebSocket server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server already running")]
    AlreadyRunning,
}

/// Errors produced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} already exists with different parameters")]
    Conflict(String),

    #[error("chunk index {index} out of range (total {total})")]
    OutOfRange { index: u32, total: u32 },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("session {upload_id} incomplete: {missing} chunk(s) missing")]
    Incomplete { upload_id: String, missing: u32 },

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("catalog error: {0}")]
    Catalog(String),
}

impl StoreError {
    /// Wire error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound(_) => ERR_NOT_FOUND,
            Self::Conflict(_) => ERR_CONFLICT,
            Self::OutOfRange { .. } => ERR_OUT_OF_RANGE,
            Self::Invalid(_) => ERR_BAD_REQUEST,
            Self::Incomplete { .. } => ERR_INCOMPLETE,
            Self::IntegrityMismatch { .. } => ERR_INTEGRITY,
            Self::Transfer(e) => match e {
                TransferError::ChecksumMismatch { .. } => ERR_CHUNK_CHECKSUM,
                TransferError::IndexOutOfRange { .. } => ERR_OUT_OF_RANGE,
                TransferError::InvalidChunkSize
                | TransferError::TooManyChunks { .. }
                | TransferError::InvalidUploadId(_)
                | TransferError::InvalidFileName(_)
                | TransferError::InvalidFingerprint(_) => ERR_BAD_REQUEST,
                _ => ERR_INTERNAL,
            },
            Self::Io(_) | Self::Json(_) | Self::Catalog(_) => ERR_INTERNAL,
        }
    }
}

/// Maps a failed `spawn_blocking` join into an I/O error.
pub(crate) fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Io(std::io::Error::other(e))
}
