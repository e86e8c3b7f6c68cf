//! Upload configuration, requests, outcomes and progress events.

use std::path::PathBuf;
use std::time::Duration;

use chunkdrop_protocol::constants::{
    DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, WS_BINARY_REQUEST_TIMEOUT, WS_REQUEST_TIMEOUT,
};
use chunkdrop_protocol::types::UploadMetadata;

use crate::error::UploadError;
use crate::retry::RetryPolicy;

/// Tunables for one upload, passed explicitly to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Bytes per chunk for new sessions. Resumed sessions keep theirs.
    pub chunk_size: u64,
    /// Chunks sent concurrently in one batch.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Deadline for a single chunk send.
    pub chunk_timeout: Duration,
    /// Deadline for the other requests.
    pub request_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 3,
            retry: RetryPolicy::default(),
            chunk_timeout: WS_BINARY_REQUEST_TIMEOUT,
            request_timeout: WS_REQUEST_TIMEOUT,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidConfig("chunk size must be greater than zero".into()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(UploadError::InvalidConfig(format!(
                "chunk size {} exceeds the {MAX_CHUNK_SIZE}-byte limit",
                self.chunk_size
            )));
        }
        if self.concurrency == 0 {
            return Err(UploadError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(UploadError::InvalidConfig("at least one attempt per chunk is required".into()));
        }
        if self.chunk_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(UploadError::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// What to upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub path: PathBuf,
    /// Name registered on the server; defaults to the path's file name.
    pub file_name: Option<String>,
    pub metadata: UploadMetadata,
    /// Resume this session instead of looking one up or creating one.
    pub upload_id: Option<String>,
}

impl UploadRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_name: None,
            metadata: UploadMetadata::default(),
            upload_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: UploadMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn resume(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }
}

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub upload_id: String,
    pub archive_id: String,
    pub file_size: u64,
    pub total_chunks: u32,
    /// Chunks sent by this run; already-accepted chunks are not counted.
    pub chunks_sent: u32,
    /// Whether the session existed before this run.
    pub resumed: bool,
}

/// Progress notifications published while an upload runs.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// Session opened and remaining work computed.
    Prepared {
        upload_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        remaining: u32,
        resumed: bool,
    },
    /// Recomputed at batch boundaries from the server's completed set.
    Progress {
        upload_id: String,
        percent: f64,
        completed_chunks: u32,
        total_chunks: u32,
    },
    ChunkRetry {
        upload_id: String,
        index: u32,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    PassFinished {
        upload_id: String,
        pass: u32,
        failed: Vec<u32>,
    },
    Finalizing {
        upload_id: String,
    },
    Completed {
        upload_id: String,
        archive_id: String,
    },
    Failed {
        upload_id: String,
        error: String,
    },
}
