//! Upload WebSocket server.
//!
//! Listens on a TCP port and serves any number of concurrent client
//! connections. Sessions are independent of connections: a client may
//! resume an upload over a fresh connection.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use chunkdrop_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection::{self, ClientConnection};
use crate::handler::Handler;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 7640;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }
}

/// The upload WebSocket server.
pub struct UploadServer<H: Handler> {
    handler: Arc<H>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    connections: Mutex<Vec<ClientConnection>>,
    cancel: CancellationToken,
}

impl<H: Handler> UploadServer<H> {
    /// Binds the listening socket. Call [`run`](Self::run) to start serving.
    pub async fn bind(config: ServerConfig, handler: Arc<H>) -> Result<Arc<Self>, ServerError> {
        let listener = TcpListener::bind(SocketAddr::new(config.host, config.port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Arc::new(Self {
            handler,
            listener: Mutex::new(Some(listener)),
            local_addr,
            connections: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }))
    }

    /// Returns the address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the listening port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the handler shared by every connection.
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Number of connections whose pumps are still running.
    pub async fn connection_count(&self) -> usize {
        let mut conns = self.connections.lock().await;
        conns.retain(ClientConnection::is_alive);
        conns.len()
    }

    /// Closes every open connection; the server keeps accepting new ones.
    ///
    /// Returns the number of connections closed.
    pub async fn disconnect_all(&self) -> usize {
        let conns = std::mem::take(&mut *self.connections.lock().await);
        for conn in &conns {
            conn.close_and_wait().await;
        }
        if !conns.is_empty() {
            tracing::info!(count = conns.len(), "dropped all client connections");
        }
        conns.len()
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;
        tracing::info!("upload server listening on {}", self.local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    let conns = std::mem::take(&mut *self.connections.lock().await);
                    for conn in &conns {
                        conn.close_and_wait().await;
                    }
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection to WebSocket and starts its pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
        tracing::info!(%peer_addr, "WebSocket connection established");

        let conn = connection::spawn_connection(
            ws_stream,
            peer_addr.to_string(),
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );

        let mut conns = self.connections.lock().await;
        conns.retain(ClientConnection::is_alive);
        conns.push(conn);
        Ok(())
    }
}
