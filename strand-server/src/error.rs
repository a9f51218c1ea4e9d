use thiserror::Error;

use strand_activity::ActivityError;
use strand_core::CoreError;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by the server, its connections and its configuration.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error("Invalid workspace name: {0:?}")]
    InvalidWorkspace(String),

    #[error("Workspace {0} is full")]
    WorkspaceFull(String),

    #[error("Request failed: {0}")]
    Remote(String),

    #[error("Connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}
