//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! ws://host/<workspace>
//!   Client A ──┐
//!              ├── Session ── Workspace ── MemoryTxLog ── WorkspaceStore (RocksDB)
//!   Client B ──┘                  │
//!                          BroadcastGroup
//!                                 │
//!                      ┌──────────┼───────────┐
//!                      ▼          ▼           ▼
//!                   Client A   Client B    Client C
//! ```
//!
//! Every connection names its workspace in the URL path. The session opens
//! with `hello`, which also negotiates the frame codec; from then on the
//! session receives every committed transaction of its workspace.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use strand_core::WorkspaceId;

use crate::broadcast::{SessionInfo, TxBatch};
use crate::error::ServerError;
use crate::protocol::{Call, Request, Response};
use crate::send::{send_response, DEFAULT_CHUNK_LIMIT};
use crate::session::{ConnectionSocket, Session, SessionState, WsSocket};
use crate::storage::{DomainStore, StoreConfig};
use crate::workspace::{parse_workspace, Workspace, WorkspaceRegistry, WorkspaceSettings};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Approximate JSON bytes per chunk of a large result (0 = never chunk)
    pub chunk_limit: usize,
    /// Broadcast channel capacity per workspace
    pub broadcast_capacity: usize,
    /// Maximum sessions per workspace
    pub max_sessions_per_workspace: usize,
    /// Frames queued per session before sends wait
    pub send_queue_capacity: usize,
    /// Heartbeat interval in seconds (0 = off)
    pub heartbeat_interval_secs: u64,
    /// Trigger workers per workspace
    pub trigger_partitions: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            chunk_limit: DEFAULT_CHUNK_LIMIT,
            broadcast_capacity: 256,
            max_sessions_per_workspace: 100,
            send_queue_capacity: 64,
            heartbeat_interval_secs: 30,
            trigger_partitions: 4,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that could not be decoded.
    pub rejected_frames: u64,
    pub active_workspaces: usize,
}

/// The session server.
pub struct StrandServer {
    config: ServerConfig,
    registry: Arc<WorkspaceRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl StrandServer {
    /// Create a server. Storage is opened with default tuning when
    /// `config.storage_path` is set.
    pub fn new(config: ServerConfig, settings: WorkspaceSettings) -> Result<Self, ServerError> {
        Self::with_store_config(config, StoreConfig::default(), settings)
    }

    /// Create a server whose storage uses `store_config` tuning. The path
    /// comes from `config.storage_path`.
    pub fn with_store_config(
        config: ServerConfig,
        store_config: StoreConfig,
        mut settings: WorkspaceSettings,
    ) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DomainStore::open(StoreConfig {
                path: path.clone(),
                ..store_config
            })?)),
            None => None,
        };

        settings.broadcast_capacity = config.broadcast_capacity;
        settings.max_sessions = config.max_sessions_per_workspace;
        settings.pipeline.partitions = config.trigger_partitions;

        Ok(Self {
            config,
            registry: Arc::new(WorkspaceRegistry::new(store, settings)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Result<Self, ServerError> {
        Self::new(ServerConfig::default(), WorkspaceSettings::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                config: self.config.clone(),
                registry: self.registry.clone(),
                stats: self.stats.clone(),
                addr,
            };
            tokio::spawn(async move {
                if let Err(e) = connection.handle(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_workspaces = self.registry.workspace_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }
}

/// Per-connection context.
struct Connection {
    config: ServerConfig,
    registry: Arc<WorkspaceRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    addr: SocketAddr,
}

impl Connection {
    async fn handle(self, stream: TcpStream) -> Result<(), ServerError> {
        let addr = self.addr;
        let mut workspace_id: Option<WorkspaceId> = None;
        let callback = |request: &HandshakeRequest, response: HandshakeResponse| {
            match parse_workspace(request.uri().path()) {
                Ok(id) => {
                    workspace_id = Some(id);
                    Ok(response)
                }
                Err(e) => {
                    let mut rejection = ErrorResponse::new(Some(e.to_string()));
                    *rejection.status_mut() = StatusCode::BAD_REQUEST;
                    Err(rejection)
                }
            }
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some(workspace_id) = workspace_id else {
            return Err(ServerError::InvalidWorkspace(String::new()));
        };
        let workspace = self.registry.get_or_open(&workspace_id).await?;

        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let (socket, writer) = WsSocket::spawn(ws_sender, self.config.send_queue_capacity);
        let mut session = Session::new(workspace_id.clone(), socket.clone());
        let info = SessionInfo {
            session_id: session.id,
            remote: Some(addr),
        };
        log::info!("Session {} connected to {workspace_id} from {addr}", session.id);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut broadcast_rx: Option<broadcast::Receiver<TxBatch>> = None;
        let mut heartbeat = (self.config.heartbeat_interval_secs > 0).then(|| {
            let period = Duration::from_secs(self.config.heartbeat_interval_secs);
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        let result = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += message.len() as u64;
                            }
                            let request = match session.codec().decode_message::<Request>(&message) {
                                Ok(Some(request)) => request,
                                Ok(None) => continue,
                                Err(e) if e.is_incomplete() => {
                                    log::trace!("Dropped incomplete frame from {addr}");
                                    continue;
                                }
                                Err(e) => {
                                    log::warn!("Rejected frame from {addr}: {e}");
                                    self.stats.write().await.rejected_frames += 1;
                                    continue;
                                }
                            };
                            if let Err(e) = self
                                .handle_request(request, &mut session, &workspace, &info, &mut broadcast_rx)
                                .await
                            {
                                break Err(e);
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if socket.send(Message::Pong(data)).await.is_err() {
                                break Ok(());
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }

                        _ => {}
                    }
                }

                // Committed transactions of the workspace
                batch = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // Not joined before hello
                        std::future::pending().await
                    }
                } => {
                    match batch {
                        Ok(batch) => {
                            let frame = Response::transactions(&batch);
                            if let Err(e) =
                                send_response(socket.as_ref(), frame, self.config.chunk_limit, session.codec()).await
                            {
                                break Err(e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            workspace.broadcast().record_lag(n);
                            log::warn!("Session {} lagged by {n} batches", session.id);
                        }
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }

                _ = async {
                    match heartbeat.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break Ok(());
                    }
                }
            }

            if socket.is_closed() {
                break Ok(());
            }
        };

        // Cleanup: leave the workspace and flush the writer
        session.closing();
        if broadcast_rx.is_some() {
            workspace.leave(&info).await;
        }
        socket.close();
        drop(session);
        drop(socket);
        let _ = writer.await;

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Session {} left {workspace_id}", info.session_id);
        result
    }

    async fn handle_request(
        &self,
        request: Request,
        session: &mut Session,
        workspace: &Arc<Workspace>,
        info: &SessionInfo,
        broadcast_rx: &mut Option<broadcast::Receiver<TxBatch>>,
    ) -> Result<(), ServerError> {
        let id = request.id;
        let socket = session.socket().clone();
        let call = match request.call() {
            Ok(call) => call,
            Err(e) => {
                log::debug!("Bad request from {}: {e}", self.addr);
                let reply = Response::error(id, e.to_string());
                return send_response(socket.as_ref(), reply, 0, session.codec()).await;
            }
        };

        let response = match call {
            Call::Hello(hello) => {
                if broadcast_rx.is_none() {
                    match workspace.join(info.clone()).await {
                        Ok(rx) => *broadcast_rx = Some(rx),
                        Err(e) => {
                            let reply = Response::error(id, e.to_string());
                            send_response(socket.as_ref(), reply, 0, session.codec()).await?;
                            return Err(e);
                        }
                    }
                }
                // The reply still goes out in the codec the client used.
                let previous = session.open(hello);
                let reply = Response::ok(
                    id,
                    json!({
                        "session": session.id,
                        "binary": hello.binary,
                        "compression": hello.compression,
                    }),
                );
                return send_response(socket.as_ref(), reply, 0, previous).await;
            }
            Call::Ping => Response::ok(id, json!("pong")),
            _ if session.state() != SessionState::Open => {
                Response::error(id, "session is not open, send hello first")
            }
            Call::FindAll(params) => match workspace.find_all(&params).await {
                Ok(result) => result.into_response(id),
                Err(e) => Response::error(id, e.to_string()),
            },
            Call::Tx(tx) => reply(id, workspace.apply(vec![tx]).await.map(|seq| json!(seq))),
            Call::LoadCollaborative(reference) => reply(
                id,
                workspace
                    .load_collaborative(&reference)
                    .await
                    .map(|content| json!(content)),
            ),
            Call::UpdateCollaborative { reference, update } => reply(
                id,
                workspace
                    .update_collaborative(&reference, &update)
                    .await
                    .map(|seq| json!(seq)),
            ),
        };

        send_response(socket.as_ref(), response, self.config.chunk_limit, session.codec()).await
    }
}

/// Turn a per-request outcome into a response; failures stay with the request.
fn reply(id: Option<u64>, outcome: Result<Value, ServerError>) -> Response {
    match outcome {
        Ok(result) => Response::ok(id, result),
        Err(e) => {
            log::warn!("Request {id:?} failed: {e}");
            Response::error(id, e.to_string())
        }
    }
}
