//! Asynchronous trigger execution.
//!
//! ```text
//! TransactionLog::subscribe ──► router ──hash(document)──► worker 0 ──┐
//!                                            │              worker 1 ──┼─► TransactionLog::apply(derived)
//!                                            └────────────► worker N ──┘
//! ```
//!
//! Transactions on the same document always land on the same worker, so
//! their triggers run in commit order. Derived batches are committed
//! atomically; a failed batch is logged and dropped without affecting the
//! transaction that caused it.
//!
//! The router tracks the next sequence it expects. When the subscription
//! lags or skips ahead, the gap is read back with
//! [`TransactionLog::entries_since`]; entries that already left the log's
//! retention window are counted as failed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use strand_core::{LogEntry, TransactionLog, Tx};

use crate::error::{ActivityError, ActivityResult};
use crate::references::ReferenceTrigger;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of workers (partitions).
    pub partitions: usize,
    /// Entries buffered per worker before the router waits.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub processed: u64,
    pub derived: u64,
    pub failed: u64,
}

#[derive(Default)]
struct AtomicPipelineStats {
    processed: AtomicU64,
    derived: AtomicU64,
    failed: AtomicU64,
}

/// Worker index for `tx`: the mutated document, hashed.
pub fn partition(tx: &Tx, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    tx.routing_id().hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

pub struct TriggerPipeline {
    router: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<AtomicPipelineStats>,
}

impl TriggerPipeline {
    /// Subscribe to `tx_log` and start the router and workers.
    ///
    /// The subscription is taken before this returns, so every transaction
    /// committed afterwards is seen.
    pub fn spawn(
        trigger: Arc<ReferenceTrigger>,
        tx_log: Arc<dyn TransactionLog>,
        config: PipelineConfig,
    ) -> ActivityResult<Self> {
        if config.partitions == 0 || config.queue_capacity == 0 {
            return Err(ActivityError::InvalidConfig(
                "pipeline needs at least one partition and a non-empty queue".into(),
            ));
        }

        let stats = Arc::new(AtomicPipelineStats::default());
        let mut senders = Vec::with_capacity(config.partitions);
        let mut workers = Vec::with_capacity(config.partitions);
        for index in 0..config.partitions {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(
                index,
                rx,
                trigger.clone(),
                tx_log.clone(),
                stats.clone(),
            )));
        }

        let next = tx_log.next_sequence();
        let mut subscription = tx_log.subscribe();
        let mut routing = Router {
            senders,
            tx_log,
            stats: stats.clone(),
            next,
        };
        let router = tokio::spawn(async move {
            loop {
                let routed = match subscription.recv().await {
                    Ok(entry) if entry.sequence > routing.next => routing.catch_up(Some(entry)).await,
                    Ok(entry) if entry.sequence < routing.next => true,
                    Ok(entry) => routing.route(entry).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Trigger router lagged by {n} transactions, replaying from the log");
                        routing.catch_up(None).await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !routed {
                    break;
                }
            }
        });

        log::info!("Trigger pipeline started with {} partitions", config.partitions);
        Ok(Self {
            router,
            workers,
            stats,
        })
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            processed: self.stats.processed.load(Ordering::Relaxed),
            derived: self.stats.derived.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    pub fn partitions(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for TriggerPipeline {
    fn drop(&mut self) {
        self.router.abort();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

struct Router {
    senders: Vec<mpsc::Sender<Arc<LogEntry>>>,
    tx_log: Arc<dyn TransactionLog>,
    stats: Arc<AtomicPipelineStats>,
    next: u64,
}

impl Router {
    /// Hand `entry` to its worker. Returns false once the worker is gone.
    async fn route(&mut self, entry: Arc<LogEntry>) -> bool {
        let target = partition(&entry.tx, self.senders.len());
        self.next = entry.sequence + 1;
        if self.senders[target].send(entry).await.is_err() {
            log::warn!("Trigger worker {target} is gone, stopping router");
            return false;
        }
        true
    }

    /// Route everything retained from `next` on. `received` is the entry
    /// that revealed the gap, if any.
    async fn catch_up(&mut self, received: Option<Arc<LogEntry>>) -> bool {
        let mut missed = self.tx_log.entries_since(self.next).await;
        if let Some(entry) = received {
            if missed.last().map_or(true, |last| last.sequence < entry.sequence) {
                missed.push(entry);
            }
        }
        for entry in missed {
            if entry.sequence < self.next {
                continue;
            }
            if entry.sequence > self.next {
                let lost = entry.sequence - self.next;
                self.stats.failed.fetch_add(lost, Ordering::Relaxed);
                log::error!(
                    "Trigger router lost {lost} transactions before sequence {}",
                    entry.sequence
                );
            }
            if !self.route(entry).await {
                return false;
            }
        }
        true
    }
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<Arc<LogEntry>>,
    trigger: Arc<ReferenceTrigger>,
    tx_log: Arc<dyn TransactionLog>,
    stats: Arc<AtomicPipelineStats>,
) {
    while let Some(entry) = rx.recv().await {
        match trigger.on_tx(&entry.tx).await {
            Ok(derived) if derived.is_empty() => {}
            Ok(derived) => {
                let count = derived.len() as u64;
                match tx_log.apply(derived).await {
                    Ok(sequence) => {
                        stats.derived.fetch_add(count, Ordering::Relaxed);
                        log::debug!(
                            "Worker {index}: tx {} derived {count} transactions (up to {sequence})",
                            entry.tx.id
                        );
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        log::error!("Worker {index}: dropping {count} derived transactions of {}: {e}", entry.tx.id);
                    }
                }
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Worker {index}: trigger failed for tx {}: {e}", entry.tx.id);
            }
        }
        stats.processed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{class, Attributes, DocId, Hierarchy, MemoryDb, MemoryTxLog, TxFactory};

    #[test]
    fn test_partition_follows_mutated_document() {
        let f = TxFactory::new(DocId::new());
        let owner = DocId::new();
        let message = DocId::new();
        let create = f.collection(
            owner,
            class::SPACE,
            DocId::nil(),
            "messages",
            f.create_doc(class::ACTIVITY_MESSAGE, DocId::nil(), message, Attributes::new()),
        );
        let update = f.update_doc(class::ACTIVITY_MESSAGE, DocId::nil(), message, Attributes::new());
        for n in [1, 3, 8] {
            assert_eq!(partition(&create, n), partition(&update, n));
            assert!(partition(&create, n) < n);
        }
    }

    fn idle_router(log: Arc<MemoryTxLog>, partitions: usize) -> (Router, Vec<mpsc::Receiver<Arc<LogEntry>>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..partitions).map(|_| mpsc::channel(64)).unzip();
        let router = Router {
            senders,
            tx_log: log,
            stats: Arc::new(AtomicPipelineStats::default()),
            next: 0,
        };
        (router, receivers)
    }

    fn drain(receivers: &mut [mpsc::Receiver<Arc<LogEntry>>]) -> Vec<u64> {
        let mut sequences = Vec::new();
        for rx in receivers {
            while let Ok(entry) = rx.try_recv() {
                sequences.push(entry.sequence);
            }
        }
        sequences.sort_unstable();
        sequences
    }

    #[tokio::test]
    async fn test_catch_up_routes_retained_gap() {
        let log = Arc::new(MemoryTxLog::new(Arc::new(MemoryDb::new(Arc::new(Hierarchy::platform()))), 64));
        let f = TxFactory::new(DocId::new());
        for _ in 0..5 {
            log.apply(vec![f.create_doc(class::SPACE, DocId::nil(), DocId::new(), Attributes::new())])
                .await
                .unwrap();
        }
        let (mut router, mut receivers) = idle_router(log.clone(), 2);
        router.next = 2;

        let latest = log.entries_since(4).await.pop();
        assert!(router.catch_up(latest).await);
        assert_eq!(drain(&mut receivers), vec![2, 3, 4]);
        assert_eq!(router.next, 5);
        assert_eq!(router.stats.failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_catch_up_counts_entries_outside_retention() {
        let db = Arc::new(MemoryDb::new(Arc::new(Hierarchy::platform())));
        let log = Arc::new(MemoryTxLog::new(db, 64).with_retention(2));
        let f = TxFactory::new(DocId::new());
        for _ in 0..6 {
            log.apply(vec![f.create_doc(class::SPACE, DocId::nil(), DocId::new(), Attributes::new())])
                .await
                .unwrap();
        }
        let (mut router, mut receivers) = idle_router(log, 1);
        router.next = 1;

        assert!(router.catch_up(None).await);
        assert_eq!(drain(&mut receivers), vec![4, 5]);
        assert_eq!(router.stats.failed.load(Ordering::Relaxed), 3);
        assert_eq!(router.next, 6);
    }
}
