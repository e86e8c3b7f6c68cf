//! Client error types.

use chunkdrop_protocol::constants::{
    ERR_CONFLICT, ERR_INCOMPLETE, ERR_INTEGRITY, ERR_NOT_FOUND, is_retryable,
};
use chunkdrop_protocol::frame::FrameError;
use chunkdrop_transfer::TransferError;
use tokio_tungstenite::tungstenite;

/// Errors from a single request over an [`UploadTransport`](crate::UploadTransport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("empty {0} response")]
    EmptyResponse(&'static str),

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
}

impl TransportError {
    /// Whether resending the same request may succeed.
    ///
    /// Timeouts and lost connections are transient; server errors are
    /// retryable only for the codes the protocol marks as such.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ws(_) | Self::Timeout | Self::Closed => true,
            Self::Server { code, .. } => is_retryable(*code),
            Self::Json(_) | Self::Frame(_) | Self::EmptyResponse(_) => false,
        }
    }

    /// The server error code, if the server answered with one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors produced by an upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("session conflict: {0}")]
    Conflict(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session incomplete: {0}")]
    SessionIncomplete(String),

    #[error("chunk {index} rejected: {reason}")]
    ChunkRejected { index: u32, reason: String },

    #[error("chunks still failing after two passes: {failed:?}")]
    Incomplete { failed: Vec<u32> },

    #[error("content integrity check failed: {0}")]
    Integrity(String),

    #[error("cancelled")]
    Cancelled,

    #[error("task join error: {0}")]
    Join(String),
}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Server { code, message } => match code {
                ERR_CONFLICT => Self::Conflict(message),
                ERR_NOT_FOUND => Self::NotFound(message),
                ERR_INCOMPLETE => Self::SessionIncomplete(message),
                ERR_INTEGRITY => Self::Integrity(message),
                _ => Self::Transport(TransportError::Server { code, message }),
            },
            other => Self::Transport(other),
        }
    }
}

impl From<tokio::task::JoinError> for UploadError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(code: i32) -> TransportError {
        TransportError::Server {
            code,
            message: "boom".into(),
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Closed.is_retryable());
        assert!(server(460).is_retryable());
        assert!(server(500).is_retryable());
        assert!(!server(400).is_retryable());
        assert!(!server(416).is_retryable());
        assert!(!TransportError::EmptyResponse("chunk ack").is_retryable());
    }

    #[test]
    fn server_codes_map_to_upload_errors() {
        assert!(matches!(UploadError::from(server(409)), UploadError::Conflict(_)));
        assert!(matches!(UploadError::from(server(404)), UploadError::NotFound(_)));
        assert!(matches!(UploadError::from(server(412)), UploadError::SessionIncomplete(_)));
        assert!(matches!(UploadError::from(server(422)), UploadError::Integrity(_)));
        assert!(matches!(
            UploadError::from(server(500)),
            UploadError::Transport(TransportError::Server { code: 500, .. })
        ));
        assert!(matches!(
            UploadError::from(TransportError::Timeout),
            UploadError::Transport(TransportError::Timeout)
        ));
    }

    #[test]
    fn display() {
        assert_eq!(TransportError::Timeout.to_string(), "request timed out");
        let err = UploadError::Incomplete { failed: vec![2, 5] };
        assert_eq!(err.to_string(), "chunks still failing after two passes: [2, 5]");
        assert!(server(460).to_string().contains("460"));
    }
}
