//! WebSocket server implementation
//!
//! Listens on a configurable port, upgrades incoming connections, and runs
//! one reader loop per connection. Plain HTTP requests on the same port get
//! a 200 status line and never touch the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::ServerEvent;
use super::session::{FrameOutcome, Session};
use crate::presence::{ConnectionRegistry, HeartbeatMonitor, PresenceBroadcaster};

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Presence relay server
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown_tx,
        }
    }

    /// Get a handle to the connection registry
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the relay server
    ///
    /// Accepts connections until a shutdown signal is received. The heartbeat
    /// monitor is started here, once for the process lifetime.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Presence relay listening on ws://{}", addr);

        HeartbeatMonitor::new(Arc::clone(&self.registry)).spawn(self.shutdown_tx.subscribe());

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, registry, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let remaining = self.registry.connection_count().await;
        if remaining > 0 {
            info!("Shutting down with {} connections still open", remaining);
        }

        Ok(())
    }
}

/// Handle a single incoming TCP connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    mut server_shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    if !is_upgrade_request(&stream).await? {
        return respond_plain_http(stream, peer_addr).await;
    }

    info!("New connection from {}", peer_addr);

    // Upgrade to WebSocket
    let ws_stream = accept_async(stream).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();

    // The writer task exclusively owns the sink; everything else queues
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    spawn_writer(ws_sender, outbound_rx, peer_addr);

    let (conn_shutdown_tx, mut conn_shutdown_rx) = broadcast::channel(1);
    let id = registry.register(outbound_tx.clone(), conn_shutdown_tx).await;
    let broadcaster = PresenceBroadcaster::new(Arc::clone(&registry));
    let mut session = Session::new(id, Arc::clone(&registry), broadcaster, Instant::now());

    match ServerEvent::init(id).to_json() {
        Ok(json) => {
            let _ = outbound_tx.send(Message::Text(json));
        }
        Err(e) => warn!("Failed to encode init frame for {}: {}", id, e),
    }
    debug!("Registered connection {} from {}", id, peer_addr);

    // Message handling loop
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match session.handle_text(&text, Instant::now()).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Close(frame) => {
                                let _ = outbound_tx.send(Message::Close(frame));
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = outbound_tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Transport-level pong; liveness rides the JSON PONG frame
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            // Forced close from the heartbeat monitor or rate enforcement
            _ = conn_shutdown_rx.recv() => {
                debug!("Connection {} force-closed", id);
                break;
            }
            // Server-wide shutdown
            _ = server_shutdown.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = outbound_tx.send(Message::Close(None));
                break;
            }
        }
    }

    // Deregistration and leave broadcast run exactly once per connection
    session.close().await;
    info!("Connection {} from {} closed", id, peer_addr);
    Ok(())
}

/// Spawn the task that owns the WebSocket sink and drains the outbound queue
fn spawn_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    peer_addr: SocketAddr,
) {
    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = sink.send(msg).await {
                debug!("Send to {} failed: {}", peer_addr, e);
                break;
            }
            if is_close {
                break;
            }
        }
    });
}

/// Peek the request head to decide whether this is a WebSocket upgrade
async fn is_upgrade_request(stream: &TcpStream) -> std::io::Result<bool> {
    let mut buf = [0u8; 2048];
    let n = stream.peek(&mut buf).await?;
    let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
    Ok(head.contains("upgrade: websocket"))
}

/// Answer a non-upgrade HTTP request with a plain 200 and close
async fn respond_plain_http(mut stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
    debug!("Plain HTTP request from {}", peer_addr);
    const BODY: &str = "server running";
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        BODY.len(),
        BODY
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 8080);
        assert_eq!(config.socket_addr(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_server_starts_empty() {
        let server = RelayServer::new(ServerConfig::new("127.0.0.1".to_string(), 0));
        assert_eq!(server.registry().connection_count().await, 0);
    }
}
