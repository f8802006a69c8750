//! WebSocket relay server with path-based document routing.
//!
//! Architecture:
//! ```text
//! ws://host/<doc id>
//!   │
//!   ▼
//! connection task ── frames ──► DocumentRegistry ──► DocumentSession (per doc)
//!   ▲                                                     │
//!   └──────────── outbound queue ◄── fan-out ─────────────┘
//!                                                         │
//!                                            PersistenceStore (RocksDB / memory)
//! ```
//!
//! Each connection task owns its socket: it forwards binary messages to the
//! session and drains its bounded outbound queue back onto the wire. When
//! the session drops the queue, the task closes the socket.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{ConnectionId, OutboundFrame};
use crate::error::RelayError;
use crate::registry::DocumentRegistry;
use crate::session::{DocumentId, SessionConfig};
use crate::stats::{RelayStats, StatsSnapshot};
use crate::storage::{MemoryStore, PersistenceStore, RocksStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it counts as too slow
    pub outbound_capacity: usize,
    /// Commands buffered per document session
    pub session_queue_capacity: usize,
    /// Awareness clients silent this long are removed
    pub awareness_timeout_secs: u64,
    /// How often the awareness sweep runs
    pub awareness_sweep_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Compact a document's update log when its last connection leaves
    pub compact_on_close: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            outbound_capacity: 256,
            session_queue_capacity: 1024,
            awareness_timeout_secs: 30,
            awareness_sweep_interval_secs: 5,
            storage_path: None,
            compact_on_close: true,
        }
    }
}

impl ServerConfig {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.session_queue_capacity,
            compact_on_close: self.compact_on_close,
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: DocumentRegistry,
    stats: Arc<RelayStats>,
}

impl RelayServer {
    /// Create a server, opening RocksDB storage if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, RelayError> {
        let store: Arc<dyn PersistenceStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig::at(path))?;
                log::info!("{} stored documents", store.list_documents()?.len());
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an already opened store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn PersistenceStore>) -> Self {
        let stats = Arc::new(RelayStats::new());
        let registry = DocumentRegistry::new(store, stats.clone(), config.session_config());
        Self {
            config,
            registry,
            stats,
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// close every session and flush the store.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Relay listening on {}", listener.local_addr()?);

        let sweeper = tokio::spawn(sweep_awareness(
            self.registry.clone(),
            Duration::from_secs(self.config.awareness_sweep_interval_secs.max(1)),
            Duration::from_secs(self.config.awareness_timeout_secs),
        ));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let registry = self.registry.clone();
                        let stats = self.stats.clone();
                        let capacity = self.config.outbound_capacity.max(1);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, registry, stats, capacity).await {
                                log::warn!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("Accept failed: {e}"),
                }
            }
        }

        sweeper.abort();
        let _ = sweeper.await;
        self.shutdown().await
    }

    /// Stop every session and flush persistent storage.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        self.registry.shutdown().await;
        let store = self.registry.store().clone();
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| RelayError::Io(std::io::Error::other(e)))??;
        log::info!("Relay stopped");
        Ok(())
    }

    /// Get server statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of documents with a live session.
    pub async fn active_documents(&self) -> usize {
        self.registry.len().await
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        self.registry.store()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Periodically expire idle awareness clients in every session.
async fn sweep_awareness(registry: DocumentRegistry, every: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        registry.expire_awareness(timeout).await;
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: DocumentRegistry,
    stats: Arc<RelayStats>,
    outbound_capacity: usize,
) -> Result<(), RelayError> {
    let mut requested: Option<DocumentId> = None;
    let route = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match DocumentId::from_path(req.uri().path()) {
            Some(doc_id) => {
                requested = Some(doc_id);
                Ok(resp)
            }
            None => {
                let mut reject = ErrorResponse::new(Some("missing document id".to_string()));
                *reject.status_mut() = StatusCode::BAD_REQUEST;
                Err(reject)
            }
        }
    };
    let accepted = tokio_tungstenite::accept_hdr_async(stream, route).await;
    let ws_stream = accepted?;
    let doc_id = requested.ok_or(RelayError::MissingDocumentId)?;

    stats.connection_opened();
    let conn = ConnectionId::new();
    log::info!("WebSocket connection {conn} from {addr} for {doc_id}");

    let (outbound, mut outbound_rx) = mpsc::channel::<OutboundFrame>(outbound_capacity);
    let session = match registry.connect(&doc_id, conn, outbound).await {
        Ok(session) => session,
        Err(e) => {
            stats.connection_closed();
            return Err(e);
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    stats.frame_received(bytes.len());
                    if session.frame(conn, bytes).await.is_err() {
                        break Ok(());
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                        break Err(e.into());
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    log::debug!("Ignoring text message from {conn}");
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection {conn} closed by peer");
                    break Ok(());
                }
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(_)) => {}
            },

            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                        break Err(e.into());
                    }
                }
                None => {
                    // The session detached us.
                    log::debug!("Session dropped connection {conn}, closing socket");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break Ok(());
                }
            },
        }
    };

    session.detach(conn).await;
    stats.connection_closed();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:1234");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.awareness_timeout_secs, 30);
        assert!(config.storage_path.is_none());
        assert!(config.compact_on_close);
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:1234");
        assert_eq!(server.stats(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::new(ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        })
        .unwrap();
        assert!(server.store().load(&DocumentId::new("empty")).unwrap().is_empty());
        assert_eq!(server.active_documents().await, 0);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown_signal() {
        let server = RelayServer::with_defaults();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let served = tokio::time::timeout(
            Duration::from_secs(2),
            server.serve(listener, async {}),
        )
        .await;
        assert!(matches!(served, Ok(Ok(()))));
    }
}
