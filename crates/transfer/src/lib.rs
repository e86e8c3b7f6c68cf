//! Chunk planning, content fingerprints and on-disk chunk handling.
//!
//! Shared by both sides of a chunkdrop upload: the client plans and reads
//! chunks, the server writes and assembles them.

mod chunked;
mod fingerprint;
mod plan;
mod progress;
mod resume;
mod validation;

pub use chunked::{
    Assembled, ChunkSource, ChunkWriter, FileChunkSource, assemble_parts,
    calculate_file_checksum, checksum_bytes,
};
pub use fingerprint::{Fingerprint, fingerprint_file};
pub use plan::ChunkPlan;
pub use progress::{bytes_covered, progress_percent, progress_snapshot};
pub use resume::remaining;
pub use validation::{validate_file_name, validate_upload_id};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("file of {file_size} bytes needs more than {max} chunks", max = u32::MAX)]
    TooManyChunks { file_size: u64 },

    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("chunk {0} has no stored part")]
    MissingPart(u32),

    #[error("source changed size: expected {expected} bytes, found {actual}")]
    SourceChanged { expected: u64, actual: u64 },

    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
}
