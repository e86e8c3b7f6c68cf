//! WebSocket implementation of [`UploadTransport`].
//!
//! Requests are correlated with replies by a UUID `id`. Chunks travel as
//! binary frames whose header carries the same kind of id. A dropped
//! connection is re-established transparently.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkdrop_protocol::constants::{
    MessageType, WS_BINARY_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT,
};
use chunkdrop_protocol::envelope::Message;
use chunkdrop_protocol::frame::{ChunkHeader, encode_chunk_frame};
use chunkdrop_protocol::messages::{
    CancelRequest, ChunkAck, CompleteRequest, CompleteResponse, InitSessionRequest,
    InitSessionResponse, OperationResult, SessionStatusResponse, StatusRequest,
};

use crate::error::TransportError;
use crate::pumps::read::PendingMap;
use crate::retry::RetryPolicy;
use crate::transport::{TransportFuture, UploadTransport};

/// One live WebSocket connection and its pump tasks.
struct Link {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    cancel: CancellationToken,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
    ping_handle: tokio::task::JoinHandle<()>,
}

impl Link {
    async fn open(url: &str) -> Result<Self, TransportError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();
        debug!(url, "connected");

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            pending.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(write_tx.clone(), cancel.clone()));

        Ok(Self {
            write_tx,
            pending,
            cancel,
            read_handle,
            write_handle,
            ping_handle,
        })
    }

    fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && !self.write_tx.is_closed()
    }

    async fn roundtrip(
        &self,
        id: &str,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.to_string(), tx);

        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(id);
            return Err(TransportError::Closed);
        }

        // The read pump may exit between the insert and the send, after it
        // has already drained `pending`.
        let reply = tokio::select! {
            result = tokio::time::timeout(timeout, rx) => Some(result),
            _ = self.cancel.cancelled() => None,
        };
        self.pending.lock().await.remove(id);

        match reply {
            Some(Ok(Ok(resp))) => resp.into_result().map_err(|err| TransportError::Server {
                code: err.code,
                message: err.message,
            }),
            Some(Ok(Err(_))) | None => Err(TransportError::Closed),
            Some(Err(_)) => Err(TransportError::Timeout),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}

/// Backoff used to re-establish a lost connection.
fn default_reconnect() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        initial_delay: Duration::from_millis(250),
        backoff_factor: 2.0,
        max_delay: Duration::from_secs(15),
    }
}

/// WebSocket client for one chunkdrop server.
///
/// A lost connection is re-established on the next request, with
/// exponential backoff between failed connects. A request whose connection
/// dropped before the reply arrived is sent again on the new connection;
/// every protocol operation is idempotent, so a duplicate is harmless.
pub struct WsClient {
    /// `None` for a client that cannot reconnect.
    url: Option<String>,
    link: RwLock<Arc<Link>>,
    /// Serializes reconnects so concurrent callers share one new connection.
    reconnecting: Mutex<()>,
    reconnect: RetryPolicy,
    request_timeout: Duration,
    chunk_timeout: Duration,
    closed: CancellationToken,
}

impl WsClient {
    /// Connects to `url` (e.g. `ws://127.0.0.1:7640`).
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let link = Link::open(url).await?;
        Ok(Self::with_link(Some(url.to_string()), link))
    }

    fn with_link(url: Option<String>, link: Link) -> Self {
        Self {
            url,
            link: RwLock::new(Arc::new(link)),
            reconnecting: Mutex::new(()),
            reconnect: default_reconnect(),
            request_timeout: WS_REQUEST_TIMEOUT,
            chunk_timeout: WS_BINARY_REQUEST_TIMEOUT,
            closed: CancellationToken::new(),
        }
    }

    /// Overrides the reply deadlines for requests and chunk frames.
    pub fn with_timeouts(mut self, request: Duration, chunk: Duration) -> Self {
        self.request_timeout = request;
        self.chunk_timeout = chunk;
        self
    }

    /// Overrides the backoff used when the connection has to be re-established.
    ///
    /// `max_attempts` bounds both the connects per outage and the resends of
    /// one request.
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Returns `true` while the current connection's pumps are running.
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && self.current().is_alive()
    }

    fn current(&self) -> Arc<Link> {
        let guard = self.link.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    fn replace(&self, link: Link) -> Arc<Link> {
        let link = Arc::new(link);
        let mut guard = self.link.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::clone(&link);
        link
    }

    /// Returns a live connection, reconnecting if the current one is gone.
    async fn live_link(&self) -> Result<Arc<Link>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let link = self.current();
        if link.is_alive() {
            return Ok(link);
        }
        let Some(url) = self.url.as_deref() else {
            return Err(TransportError::Closed);
        };

        let _reconnecting = self.reconnecting.lock().await;
        // Another caller may have reconnected while we waited.
        let link = self.current();
        if link.is_alive() {
            return Ok(link);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match Link::open(url).await {
                Ok(link) => {
                    info!(url, attempt, "reconnected");
                    return Ok(self.replace(link));
                }
                Err(e) if self.reconnect.allows_retry(attempt) => {
                    let delay = self.reconnect.delay_for_attempt(attempt);
                    warn!(url, attempt, error = %e, delay_ms = delay.as_millis() as u64, "reconnect failed");
                    tokio::select! {
                        _ = self.closed.cancelled() => return Err(TransportError::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "giving up reconnecting");
                    return Err(e);
                }
            }
        }
    }

    /// Sends a request and waits for the reply.
    pub async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, TransportError> {
        self.send_request_within(msg_type, payload, self.request_timeout)
            .await
    }

    async fn send_request_within<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;
        self.roundtrip(id, tungstenite::Message::Text(json.into()), timeout)
            .await
    }

    /// Sends one chunk frame and waits for its acknowledgement.
    ///
    /// A fresh id is put into the header so retries of the same chunk are
    /// told apart from late replies to earlier attempts.
    pub async fn send_chunk(&self, header: &ChunkHeader, data: &[u8]) -> Result<Message, TransportError> {
        let id = uuid::Uuid::new_v4().to_string();
        let header = ChunkHeader {
            id: id.clone(),
            ..header.clone()
        };
        let frame = encode_chunk_frame(&header, data)?;
        self.roundtrip(id, tungstenite::Message::Binary(frame.into()), self.chunk_timeout)
            .await
    }

    async fn roundtrip(
        &self,
        id: String,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let mut lost = 0;
        loop {
            let link = self.live_link().await?;
            match link.roundtrip(&id, frame.clone(), timeout).await {
                Err(TransportError::Closed) if !self.closed.is_cancelled() && self.url.is_some() => {
                    lost += 1;
                    if !self.reconnect.allows_retry(lost) {
                        return Err(TransportError::Closed);
                    }
                    warn!(id = %id, lost, "connection lost before reply, resending");
                }
                other => return other,
            }
        }
    }

    async fn call<T: Serialize, R: DeserializeOwned>(
        &self,
        msg_type: MessageType,
        payload: &T,
        what: &'static str,
    ) -> Result<R, TransportError> {
        self.call_within(msg_type, payload, what, self.request_timeout)
            .await
    }

    async fn call_within<T: Serialize, R: DeserializeOwned>(
        &self,
        msg_type: MessageType,
        payload: &T,
        what: &'static str,
        timeout: Duration,
    ) -> Result<R, TransportError> {
        let resp = self
            .send_request_within(msg_type, Some(payload), timeout)
            .await?;
        resp.parse_payload::<R>()?
            .ok_or(TransportError::EmptyResponse(what))
    }

    /// Closes the connection. The client does not reconnect afterwards.
    pub async fn close(&self) {
        self.closed.cancel();
        let link = self.current();
        let _ = link.write_tx.send(tungstenite::Message::Close(None)).await;
        link.cancel.cancel();
    }
}

impl UploadTransport for WsClient {
    fn init_session<'a>(&'a self, req: &'a InitSessionRequest) -> TransportFuture<'a, InitSessionResponse> {
        Box::pin(self.call(MessageType::InitSession, req, "init session"))
    }

    fn put_chunk<'a>(&'a self, header: &'a ChunkHeader, data: &'a [u8]) -> TransportFuture<'a, ChunkAck> {
        Box::pin(async move {
            let resp = self.send_chunk(header, data).await?;
            resp.parse_payload::<ChunkAck>()?
                .ok_or(TransportError::EmptyResponse("chunk ack"))
        })
    }

    fn get_status<'a>(&'a self, upload_id: &'a str) -> TransportFuture<'a, SessionStatusResponse> {
        Box::pin(async move {
            let req = StatusRequest {
                upload_id: upload_id.to_string(),
            };
            self.call(MessageType::GetStatus, &req, "status").await
        })
    }

    // Finalizing assembles and hashes the whole file, so it gets the
    // chunk deadline rather than the request one.
    fn complete<'a>(&'a self, req: &'a CompleteRequest) -> TransportFuture<'a, CompleteResponse> {
        Box::pin(self.call_within(MessageType::Complete, req, "complete", self.chunk_timeout))
    }

    fn cancel<'a>(&'a self, upload_id: &'a str) -> TransportFuture<'a, OperationResult> {
        Box::pin(async move {
            let req = CancelRequest {
                upload_id: upload_id.to_string(),
            };
            self.call(MessageType::Cancel, &req, "cancel").await
        })
    }
}
