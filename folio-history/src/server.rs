//! WebSocket server: live document sync, reload signals and the JSON API on
//! one socket.
//!
//! Architecture:
//! ```text
//! Client A ──┐  binary: SyncMessage      ┌── LiveDocuments ── RocksStore
//!             ├─────────────────────────►│        │
//! Client B ──┘  text: API request        │   BroadcastGroup ──► other sessions
//!                                        │
//!                                        └── VersioningService
//!                                                 │
//!                                          ConnectionRegistry ──► Reload
//! ```
//!
//! A session attaches to exactly one document with a `Join` frame. From then
//! on it receives the document's updates from other peers and a `Reload`
//! frame after every revert. API requests can be sent before or after joining.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::api;
use crate::broadcast::Frame;
use crate::doc::DEFAULT_ROOT;
use crate::live::{LiveConfig, LiveRoom};
use crate::model::DocumentId;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::registry::{Connection, Signal};
use crate::service::VersioningService;
use crate::storage::{HistoryBackend, MemoryBackend, RocksStore, StorageError, StoreConfig};

type SessionError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Name of the shared text root
    pub root_name: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Pending control signals per connection before it is dropped
    pub signal_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            root_name: DEFAULT_ROOT.to_string(),
            broadcast_capacity: 256,
            signal_capacity: 16,
        }
    }
}

impl ServerConfig {
    /// In-memory server on an ephemeral port.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            ..Self::default()
        }
    }

    fn live_config(&self) -> LiveConfig {
        LiveConfig {
            root_name: self.root_name.clone(),
            broadcast_capacity: self.broadcast_capacity,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub sync_messages: u64,
    pub api_requests: u64,
    pub total_bytes: u64,
}

pub struct HistoryServer {
    config: ServerConfig,
    service: Arc<VersioningService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl HistoryServer {
    /// Create a server, opening persistent storage if configured.
    pub fn new(config: ServerConfig) -> Result<Self, StorageError> {
        let backend: Arc<dyn HistoryBackend> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryBackend::new()),
        };
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: ServerConfig, backend: Arc<dyn HistoryBackend>) -> Self {
        let service = Arc::new(VersioningService::new(backend, config.live_config()));
        Self {
            config,
            service,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn service(&self) -> &Arc<VersioningService> {
        &self.service
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("History server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let stats = self.stats.clone();
            let signal_capacity = self.config.signal_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, service, stats, signal_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Compact every live document nobody is attached to.
    pub async fn shutdown(&self) {
        let closed = self.service.live().close_all_idle().await;
        log::info!("Shutdown: compacted {closed} documents");
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<VersioningService>,
        stats: Arc<RwLock<ServerStats>>,
        signal_capacity: usize,
    ) -> Result<(), SessionError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = Session {
            conn_id: Uuid::new_v4(),
            service: service.clone(),
            joined: None,
        };
        let mut updates_rx: Option<broadcast::Receiver<Frame>> = None;
        let mut signals_rx: Option<mpsc::Receiver<Signal>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.sync_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                let sync_msg = match SyncMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };

                                if sync_msg.msg_type == MessageType::Join {
                                    match session.join(&sync_msg, signal_capacity).await {
                                        Ok(Some(attached)) => {
                                            updates_rx = Some(attached.updates);
                                            signals_rx = Some(attached.signals);
                                            let encoded = attached.reply.encode()?;
                                            ws_sender.send(Message::Binary(encoded.into())).await?;
                                        }
                                        Ok(None) => {}
                                        Err(e) => log::error!("Join from {addr} failed: {e}"),
                                    }
                                    continue;
                                }
                                if sync_msg.msg_type == MessageType::Leave {
                                    log::info!("Peer {} left via {addr}", sync_msg.peer_id);
                                    break;
                                }

                                if let Some(reply) = session.on_sync(sync_msg).await {
                                    let encoded = reply.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }
                            }

                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.api_requests += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                let response = api::dispatch(&service, text.as_str()).await;
                                ws_sender.send(Message::Text(response.to_json().into())).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Updates from other peers of the joined document
                    frame = async {
                        match updates_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(data) => {
                                if session.is_echo(&data) {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Session {addr} lagged by {n} updates, resyncing");
                                if let Some(resync) = session.full_state() {
                                    let encoded = resync.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    // Control signals from the registry
                    signal = async {
                        match signals_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match signal {
                            Some(Signal::Reload) => {
                                if let Some(reload) = session.reload() {
                                    let encoded = reload.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }
                            }
                            None => {
                                // Dropped by the registry; no more signals will arrive
                                signals_rx = None;
                            }
                        }
                    }
                }
            }
            Ok::<(), SessionError>(())
        }
        .await;

        drop(updates_rx);
        drop(signals_rx);
        session.detach().await;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }
}

/// Document a session is attached to.
struct Joined {
    doc_id: DocumentId,
    peer_id: Uuid,
    room: Arc<LiveRoom>,
}

/// Receivers and first reply produced by a successful join.
struct Attached {
    updates: broadcast::Receiver<Frame>,
    signals: mpsc::Receiver<Signal>,
    reply: SyncMessage,
}

struct Session {
    conn_id: Uuid,
    service: Arc<VersioningService>,
    joined: Option<Joined>,
}

impl Session {
    async fn join(
        &mut self,
        msg: &SyncMessage,
        signal_capacity: usize,
    ) -> Result<Option<Attached>, SessionError> {
        if let Some(joined) = &self.joined {
            log::warn!(
                "Session {} already joined doc {}, ignoring join for {}",
                self.conn_id,
                joined.doc_id,
                msg.doc_id
            );
            return Ok(None);
        }
        let Some(doc_id) = DocumentId::parse(&msg.doc_id) else {
            log::warn!("Rejected join with invalid doc id {:?}", msg.doc_id);
            return Ok(None);
        };

        let info = msg
            .peer_info()
            .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "Anonymous"));
        let room = self.service.live().open(&doc_id).await?;
        let updates = room.updates().add_peer(info.clone()).await;

        let (connection, signals) = Connection::with_id(self.conn_id, signal_capacity);
        self.service.registry().register(&doc_id, connection).await;

        let reply = SyncMessage::sync_step2(Uuid::nil(), doc_id.as_str(), room.doc().encode_full_state());
        log::info!("Peer {} ({}) joined doc {doc_id}", info.name, info.peer_id);

        self.joined = Some(Joined {
            doc_id,
            peer_id: info.peer_id,
            room,
        });
        Ok(Some(Attached {
            updates,
            signals,
            reply,
        }))
    }

    /// Handle a sync frame after join. Returns the reply to send, if any.
    async fn on_sync(&mut self, msg: SyncMessage) -> Option<SyncMessage> {
        if msg.msg_type == MessageType::Ping {
            let peer = self.joined.as_ref().map_or(msg.peer_id, |j| j.peer_id);
            return Some(SyncMessage::pong(peer));
        }

        let Some(joined) = &self.joined else {
            log::debug!("Ignoring {:?} before join", msg.msg_type);
            return None;
        };
        if msg.doc_id != joined.doc_id.as_str() {
            log::warn!(
                "Ignoring {:?} for doc {} on session joined to {}",
                msg.msg_type,
                msg.doc_id,
                joined.doc_id
            );
            return None;
        }

        match msg.msg_type {
            MessageType::Update | MessageType::SyncStep2 => {
                if let Err(e) = self
                    .service
                    .live()
                    .apply_update(&joined.doc_id, &msg.payload, joined.peer_id)
                    .await
                {
                    log::warn!("Rejected update for doc {} from {}: {e}", joined.doc_id, joined.peer_id);
                }
                None
            }
            MessageType::SyncStep1 => match joined.room.doc().encode_diff_bytes(&msg.payload) {
                Ok(diff) => Some(SyncMessage::sync_step2(Uuid::nil(), joined.doc_id.as_str(), diff)),
                Err(e) => {
                    log::warn!("Bad state vector for doc {}: {e}", joined.doc_id);
                    None
                }
            },
            other => {
                log::debug!("Unhandled message type: {other:?}");
                None
            }
        }
    }

    /// Whether a fanned-out frame originated from this session's peer.
    fn is_echo(&self, frame: &[u8]) -> bool {
        let Some(joined) = &self.joined else {
            return false;
        };
        SyncMessage::decode(frame).is_ok_and(|m| m.peer_id == joined.peer_id)
    }

    fn full_state(&self) -> Option<SyncMessage> {
        self.joined.as_ref().map(|j| {
            SyncMessage::sync_step2(Uuid::nil(), j.doc_id.as_str(), j.room.doc().encode_full_state())
        })
    }

    fn reload(&self) -> Option<SyncMessage> {
        self.joined
            .as_ref()
            .map(|j| SyncMessage::reload(j.doc_id.as_str()))
    }

    /// Leave the joined document and compact it if this was the last session.
    async fn detach(&mut self) {
        let Some(Joined {
            doc_id,
            peer_id,
            room,
        }) = self.joined.take()
        else {
            return;
        };

        self.service.registry().unregister(&doc_id, self.conn_id).await;
        room.updates().remove_peer(&peer_id).await;
        drop(room);

        match self.service.live().close_if_idle(&doc_id).await {
            Ok(true) => log::info!("Doc {doc_id} closed (no sessions left)"),
            Ok(false) => {}
            Err(e) => log::error!("Failed to compact doc {doc_id}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.root_name, DEFAULT_ROOT);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_in_memory_server() {
        let server = HistoryServer::new(ServerConfig::for_testing()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = HistoryServer::new(config).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn test_session_ignores_sync_before_join() {
        let server = HistoryServer::new(ServerConfig::for_testing()).unwrap();
        let mut session = Session {
            conn_id: Uuid::new_v4(),
            service: server.service().clone(),
            joined: None,
        };
        let update = SyncMessage::update(Uuid::new_v4(), "d", 1, vec![0, 0]);
        assert!(session.on_sync(update).await.is_none());
        assert!(session.reload().is_none());

        let pong = session.on_sync(SyncMessage::ping(Uuid::nil())).await.unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_session_join_and_detach() {
        let server = HistoryServer::new(ServerConfig::for_testing()).unwrap();
        let service = server.service().clone();
        let mut session = Session {
            conn_id: Uuid::new_v4(),
            service: service.clone(),
            joined: None,
        };
        let info = PeerInfo::new("Ann");
        let join = SyncMessage::join("doc-1", &info).unwrap();

        let attached = session.join(&join, 4).await.unwrap().unwrap();
        assert_eq!(attached.reply.msg_type, MessageType::SyncStep2);
        let d = DocumentId::parse("doc-1").unwrap();
        assert_eq!(service.registry().connection_count(&d).await, 1);
        // A second join on the same session is ignored
        assert!(session.join(&join, 4).await.unwrap().is_none());

        drop(attached);
        session.detach().await;
        assert_eq!(service.registry().connection_count(&d).await, 0);
        assert!(service.live().open_documents().await.is_empty());
    }
}
