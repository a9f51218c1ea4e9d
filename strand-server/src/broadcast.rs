//! Fan-out of committed transactions to the sessions of one workspace.
//!
//! Each workspace has one [`BroadcastGroup`] backed by a tokio broadcast
//! channel. Batches are shared as `Arc<Vec<Tx>>` and encoded per session,
//! since sessions negotiate different codecs. A receiver that falls more
//! than `capacity` batches behind loses the oldest ones.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use strand_core::Tx;

use crate::error::ServerError;

pub type TxBatch = Arc<Vec<Tx>>;

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub batches_sent: u64,
    pub batches_dropped: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    batches_sent: AtomicU64,
    batches_dropped: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub remote: Option<SocketAddr>,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<TxBatch>,
    sessions: RwLock<HashMap<Uuid, SessionInfo>>,
    capacity: usize,
    max_sessions: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize, max_sessions: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sessions: RwLock::new(HashMap::new()),
            capacity,
            max_sessions,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a session and subscribe it to future batches.
    pub async fn join(
        &self,
        info: SessionInfo,
        workspace: &str,
    ) -> Result<broadcast::Receiver<TxBatch>, ServerError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(ServerError::WorkspaceFull(workspace.to_string()));
        }
        sessions.insert(info.session_id, info);
        Ok(self.sender.subscribe())
    }

    pub async fn leave(&self, session_id: &Uuid) -> Option<SessionInfo> {
        self.sessions.write().await.remove(session_id)
    }

    /// Returns the number of receivers the batch was queued for.
    pub fn publish(&self, batch: TxBatch) -> usize {
        let receivers = self.sender.send(batch).unwrap_or(0);
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        receivers
    }

    /// Account for batches a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.batches_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            batches_sent: self.stats.batches_sent.load(Ordering::Relaxed),
            batches_dropped: self.stats.batches_dropped.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
