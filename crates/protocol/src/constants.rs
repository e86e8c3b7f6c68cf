use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default chunk size: 4 MiB.
///
/// Well below [`WS_MAX_MESSAGE_SIZE`] so a chunk frame plus its JSON header
/// never trips the frame limit of either side.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Largest chunk size either side accepts: 32 MiB.
///
/// Leaves room under [`WS_MAX_MESSAGE_SIZE`] for the length prefix and the
/// JSON chunk header.
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Time to wait for any incoming frame before the peer is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Timeout for request/response operations (text messages).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for binary request/response operations (chunk uploads).
///
/// Chunk writes hit the receiving side's disk before the ACK is sent, so
/// this is much longer than [`WS_REQUEST_TIMEOUT`].
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from client to server
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "init_session")]
    InitSession,
    #[serde(rename = "get_status")]
    GetStatus,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "cancel")]
    Cancel,

    // Responses from server to client
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "session_initialized")]
    SessionInitialized,
    #[serde(rename = "chunk_ack")]
    ChunkAck,
    #[serde(rename = "session_status")]
    SessionStatus,
    #[serde(rename = "complete_result")]
    CompleteResult,
    #[serde(rename = "operation_result")]
    OperationResult,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Malformed request or parameters that can never succeed as sent.
pub const ERR_BAD_REQUEST: i32 = 400;
/// No session with the given id.
pub const ERR_NOT_FOUND: i32 = 404;
/// Session exists with different parameters.
pub const ERR_CONFLICT: i32 = 409;
/// Finalize requested before every chunk index was accepted.
pub const ERR_INCOMPLETE: i32 = 412;
/// Chunk index outside `[0, totalChunks)`.
pub const ERR_OUT_OF_RANGE: i32 = 416;
/// Assembled content does not match the expected digest.
pub const ERR_INTEGRITY: i32 = 422;
/// Chunk bytes do not match the checksum in their header.
pub const ERR_CHUNK_CHECKSUM: i32 = 460;
/// Storage failure on the receiving side.
pub const ERR_INTERNAL: i32 = 500;
/// Message type the receiving side does not handle.
pub const ERR_NOT_IMPLEMENTED: i32 = 501;

/// Returns `true` if an error with this code may succeed when retried as-is.
///
/// Only in-flight corruption and storage hiccups qualify; validation and
/// integrity errors are surfaced to the caller instead.
pub fn is_retryable(code: i32) -> bool {
    matches!(code, ERR_CHUNK_CHECKSUM | ERR_INTERNAL)
}
