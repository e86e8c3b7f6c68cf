//! The request/response surface an upload runs over.

use std::future::Future;
use std::pin::Pin;

use chunkdrop_protocol::frame::ChunkHeader;
use chunkdrop_protocol::messages::{
    ChunkAck, CompleteRequest, CompleteResponse, InitSessionRequest, InitSessionResponse,
    OperationResult, SessionStatusResponse,
};

use crate::error::TransportError;

/// A boxed future returned by transport methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Connection to the receiving side.
///
/// [`WsClient`](crate::WsClient) implements this over WebSocket. Keeping the
/// orchestrator behind a trait lets it run against in-process services and
/// failure-injecting mocks.
///
/// `put_chunk` may be called concurrently. Re-sending an index the server
/// already holds must be acknowledged as success.
pub trait UploadTransport: Send + Sync {
    fn init_session<'a>(&'a self, req: &'a InitSessionRequest) -> TransportFuture<'a, InitSessionResponse>;

    /// Sends one chunk. `header.checksum` is the SHA-256 of `data`.
    fn put_chunk<'a>(&'a self, header: &'a ChunkHeader, data: &'a [u8]) -> TransportFuture<'a, ChunkAck>;

    fn get_status<'a>(&'a self, upload_id: &'a str) -> TransportFuture<'a, SessionStatusResponse>;

    fn complete<'a>(&'a self, req: &'a CompleteRequest) -> TransportFuture<'a, CompleteResponse>;

    fn cancel<'a>(&'a self, upload_id: &'a str) -> TransportFuture<'a, OperationResult>;
}
