//! Client connection management: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;

use chunkdrop_protocol::constants::{
    ERR_NOT_IMPLEMENTED, MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use chunkdrop_protocol::envelope::Message;
use chunkdrop_protocol::frame::parse_chunk_frame;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Handle for sending messages to one connected client.
///
/// Cloneable and cheap: wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the client disconnected.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn for_test(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to one client.
///
/// Owns the read/write pump tasks and provides a [`Sender`].
pub struct ClientConnection {
    pub remote_addr: String,
    sender: Sender,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl ClientConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Returns `true` while the pumps are running.
    pub fn is_alive(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// Signals shutdown.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Signals shutdown and waits until the read pump has finished.
    pub async fn close_and_wait(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// The pumps run as background tokio tasks and stop when the connection
/// closes or the cancel token fires.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    remote_addr: String,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ClientConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let done = CancellationToken::new();
    let sender = Sender { tx };

    let conn = ClientConnection {
        remote_addr: remote_addr.clone(),
        sender: sender.clone(),
        cancel: cancel.clone(),
        done: done.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    tokio::spawn(async move {
        read_pump(ws_stream, sender, Arc::clone(&handler), cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        cancel.cancel();
        handler.on_disconnected().await;
        tracing::info!(peer = %remote_addr, "client disconnected");
        done.cancel();
    });

    conn
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(ws_msg) = msg else { break };
                if let Err(e) = sink.send(ws_msg).await {
                    tracing::error!("write pump send error: {e}");
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches each to the handler on its
/// own task, so chunks arriving on one connection are stored concurrently.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    // Any frame from the client counts as liveness.
    let idle = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = &mut idle => {
                tracing::warn!("client idle timeout, closing connection");
                break;
            }

            frame = stream.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.len() > WS_MAX_MESSAGE_SIZE {
                            tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        let handler = Arc::clone(&handler);
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            dispatch_text(&handler, &sender, text.as_str()).await;
                        });
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        if data.len() > WS_MAX_MESSAGE_SIZE {
                            tracing::error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        let handler = Arc::clone(&handler);
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            dispatch_binary(&handler, &sender, &data).await;
                        });
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                    }
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Ok(WsMessage::Close(_))) => {
                        tracing::info!("received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Dispatches a text (JSON) message to the appropriate handler method.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    let s = sender.clone();
    match msg.msg_type {
        MessageType::Ping => handler.on_ping(s, msg).await,
        MessageType::InitSession => handler.on_init_session(s, msg).await,
        MessageType::GetStatus => handler.on_get_status(s, msg).await,
        MessageType::Complete => handler.on_complete(s, msg).await,
        MessageType::Cancel => handler.on_cancel(s, msg).await,
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg, ERR_NOT_IMPLEMENTED, "unknown message type");
        }
    }
}

/// Dispatches a binary chunk frame to the handler.
async fn dispatch_binary<H: Handler>(handler: &Arc<H>, sender: &Sender, data: &[u8]) {
    match parse_chunk_frame(data) {
        Ok((header, payload)) => handler.on_chunk(sender.clone(), header, payload).await,
        Err(e) => {
            // Without a parsed header there is no id to answer; the client's
            // request times out and is retried.
            tracing::error!("failed to parse chunk frame: {e}");
        }
    }
}
