//! # strand-server: Session transport and storage for Strand
//!
//! Serves workspaces over WebSocket and persists them in RocksDB.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌───────────────┐
//! │ SessionClient │ ◄─────────────────► │ StrandServer  │
//! │ (per user)    │  JSON / bincode+lz4 │ (central)     │
//! └───────────────┘                     └───────┬───────┘
//!                                               │ ws://host/<workspace>
//!                                               ▼
//!                                       ┌───────────────┐
//!                                       │  Workspace    │──► TriggerPipeline
//!                                       │  MemoryTxLog  │──► BroadcastGroup
//!                                       └───────┬───────┘
//!                                               ▼
//!                                       ┌───────────────┐
//!                                       │ DomainStore   │ (RocksDB)
//!                                       │ index advisor │
//!                                       └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: requests, responses and the negotiated frame codec
//! - [`session`]: per-connection state and the outbound socket
//! - [`send`]: chunked delivery of large results
//! - [`broadcast`]: per-workspace fan-out of committed transactions
//! - [`workspace`]: tenant state, recovery and the workspace registry
//! - [`server`]: WebSocket session server
//! - [`client`]: WebSocket session client
//! - [`storage`]: RocksDB store and the index advisor
//! - [`config`]: TOML configuration

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod send;
pub mod server;
pub mod session;
pub mod storage;
pub mod workspace;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, SessionInfo, TxBatch};
pub use client::{SessionClient, SessionEvent};
pub use config::AppConfig;
pub use error::{ConfigError, ServerError};
pub use protocol::{
    ChunkInfo, Codec, FindParams, FindResult, HelloParams, ProtocolError, Request, Response,
};
pub use send::{chunk_ranges, send_response, DEFAULT_CHUNK_LIMIT};
pub use server::{ServerConfig, ServerStats, StrandServer};
pub use session::{ConnectionSocket, Session, SessionState, WsSocket};
pub use storage::{
    DomainIndexAdvisor, DomainIndexConfiguration, DomainOperations, DomainStore, StoreConfig,
    StoreError, WorkspaceStore,
};
pub use workspace::{Workspace, WorkspaceRegistry, WorkspaceSettings};
