//! Ordered, checksummed log of committed transactions.
//!
//! ```text
//! apply(batch) ──► MemoryDb overlay ──► LogSink::persist ──► commit
//!                                                              │
//!                         broadcast::Sender<Arc<LogEntry>> ◄───┘
//!                              │            │
//!                          triggers     sessions
//! ```
//!
//! Sequence numbers are assigned under a commit lock so subscribers see
//! entries in commit order. The broadcast channel is bounded; a subscriber
//! that falls behind reads the entries it missed back through
//! [`TransactionLog::entries_since`], which serves the most recent
//! `retention` entries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::error::CoreResult;
use crate::memdb::{ChangeSet, MemoryDb};
use crate::tx::Tx;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub tx: Tx,
    pub checksum: u32,
}

impl LogEntry {
    pub fn new(sequence: u64, tx: Tx) -> Self {
        let checksum = Self::compute_checksum(sequence, &tx);
        Self {
            sequence,
            tx,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, &self.tx)
    }

    /// FNV-1a over the sequence number and the JSON form of the transaction.
    fn compute_checksum(sequence: u64, tx: &Tx) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in sequence.to_be_bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        for byte in serde_json::to_vec(tx).unwrap_or_default() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }
}

/// Durable side of the log. Called inside the commit, before the batch
/// becomes visible; an error aborts the batch.
pub trait LogSink: Send + Sync {
    fn persist(&self, entries: &[LogEntry], changes: &ChangeSet) -> CoreResult<()>;
}

/// Entries kept for replay when no retention is configured.
pub const DEFAULT_RETENTION: usize = 65_536;

#[async_trait]
pub trait TransactionLog: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<Arc<LogEntry>>;

    /// Sequence the next committed entry will get.
    fn next_sequence(&self) -> u64;

    /// Retained entries with `sequence >= from`, oldest first. Entries older
    /// than the retention window are gone; callers detect that from the
    /// first returned sequence.
    async fn entries_since(&self, from: u64) -> Vec<Arc<LogEntry>>;

    /// Commit `txs` all-or-nothing. Returns the sequence of the last entry.
    async fn apply(&self, txs: Vec<Tx>) -> CoreResult<u64>;
}

pub struct MemoryTxLog {
    db: Arc<MemoryDb>,
    next_sequence: AtomicU64,
    sender: broadcast::Sender<Arc<LogEntry>>,
    sink: Option<Arc<dyn LogSink>>,
    history: Mutex<VecDeque<Arc<LogEntry>>>,
    retention: usize,
    commit: Mutex<()>,
}

impl MemoryTxLog {
    pub fn new(db: Arc<MemoryDb>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            db,
            next_sequence: AtomicU64::new(0),
            sender,
            sink: None,
            history: Mutex::new(VecDeque::new()),
            retention: DEFAULT_RETENTION,
            commit: Mutex::new(()),
        }
    }

    /// Keep at most `retention` entries for [`TransactionLog::entries_since`].
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Continue numbering after recovered entries.
    pub fn starting_at(self, next_sequence: u64) -> Self {
        self.next_sequence.store(next_sequence, Ordering::SeqCst);
        self
    }

    pub fn db(&self) -> &Arc<MemoryDb> {
        &self.db
    }
}

#[async_trait]
impl TransactionLog for MemoryTxLog {
    fn subscribe(&self) -> broadcast::Receiver<Arc<LogEntry>> {
        self.sender.subscribe()
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    async fn entries_since(&self, from: u64) -> Vec<Arc<LogEntry>> {
        let history = self.history.lock().await;
        let skip = history.partition_point(|entry| entry.sequence < from);
        history.iter().skip(skip).cloned().collect()
    }

    async fn apply(&self, txs: Vec<Tx>) -> CoreResult<u64> {
        let _guard = self.commit.lock().await;
        let start = self.next_sequence.load(Ordering::SeqCst);
        if txs.is_empty() {
            return Ok(start.saturating_sub(1));
        }

        let entries: Vec<LogEntry> = txs
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, tx)| LogEntry::new(start + i as u64, tx))
            .collect();

        let sink = self.sink.clone();
        self.db
            .apply_with(&txs, |changes| match &sink {
                Some(sink) => sink.persist(&entries, changes),
                None => Ok(()),
            })
            .await?;

        let last = start + entries.len() as u64 - 1;
        self.next_sequence.store(last + 1, Ordering::SeqCst);
        let mut history = self.history.lock().await;
        for entry in entries {
            log::trace!("Committed tx {} at sequence {}", entry.tx.id, entry.sequence);
            let entry = Arc::new(entry);
            if self.retention > 0 {
                if history.len() == self.retention {
                    history.pop_front();
                }
                history.push_back(entry.clone());
            }
            let _ = self.sender.send(entry);
        }
        Ok(last)
    }
}
