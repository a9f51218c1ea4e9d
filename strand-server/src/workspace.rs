//! Workspaces: one isolated document set per tenant.
//!
//! ```text
//!                 ┌──────────── Workspace ─────────────────────────────┐
//! tx / update ──► │ MemoryTxLog ──persist──► WorkspaceStore (RocksDB)  │
//!                 │     │  subscribe                                   │
//!                 │     ├──► TriggerPipeline ──derived txs──► apply    │
//!                 │     └──► forwarder ──batches──► BroadcastGroup ────┼──► sessions
//!                 │ MemoryDb ◄── findAll                               │
//!                 └────────────────────────────────────────────────────┘
//! ```
//!
//! A workspace is opened on first use: persisted documents are recovered
//! into memory, the log continues after the last persisted sequence and the
//! index advisor brings every domain's indexes in line with the schema.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use serde_json::Value;
use strand_activity::{
    EmailConfig, EmailProvider, InboxProvider, MentionDispatcher, NotificationProvider,
    NotificationSettings, PipelineConfig, PipelineStats, PreferenceRules, ReferenceTrigger,
    TemplateRegistry, TriggerPipeline,
};
use strand_core::markup::merge_update;
use strand_core::{
    Attributes, CollaborativeRef, CollaborativeStore, DocId, Domain, Hierarchy, LogSink,
    MemoryCollaborativeStore, MemoryDb, MemoryTxLog, SchemaDescriptor, TransactionLog,
    TriggerStore, Tx, TxFactory, WorkspaceId,
};

use crate::broadcast::{BroadcastGroup, SessionInfo, TxBatch};
use crate::error::ServerError;
use crate::protocol::{FindParams, FindResult};
use crate::storage::{DomainIndexAdvisor, DomainIndexConfiguration, DomainStore, WorkspaceStore};

/// Account recorded on transactions the server itself issues.
pub const SYSTEM_ACCOUNT: DocId = DocId(uuid::Uuid::nil());

const MAX_WORKSPACE_NAME: usize = 64;

/// Everything a workspace needs besides its name.
#[derive(Clone)]
pub struct WorkspaceSettings {
    pub schema: Arc<dyn SchemaDescriptor>,
    pub indexes: Vec<DomainIndexConfiguration>,
    pub notifications: NotificationSettings,
    pub email: EmailConfig,
    pub pipeline: PipelineConfig,
    /// Batches buffered per session before it starts losing them.
    pub broadcast_capacity: usize,
    pub max_sessions: usize,
    /// Entries buffered per log subscriber.
    pub log_capacity: usize,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            schema: Arc::new(Hierarchy::platform()),
            indexes: Vec::new(),
            notifications: NotificationSettings::default(),
            email: EmailConfig::default(),
            pipeline: PipelineConfig::default(),
            broadcast_capacity: 256,
            max_sessions: 100,
            log_capacity: 1024,
        }
    }
}

/// Check a workspace name taken from a connection URL.
///
/// Names are used as storage key prefixes, so only ASCII letters, digits,
/// `-` and `_` are accepted.
pub fn parse_workspace(path: &str) -> Result<WorkspaceId, ServerError> {
    let name = path.trim_matches('/');
    let valid = !name.is_empty()
        && name.len() <= MAX_WORKSPACE_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(WorkspaceId::new(name))
    } else {
        Err(ServerError::InvalidWorkspace(name.to_string()))
    }
}

pub struct Workspace {
    id: WorkspaceId,
    schema: RwLock<Arc<dyn SchemaDescriptor>>,
    db: Arc<MemoryDb>,
    tx_log: Arc<MemoryTxLog>,
    broadcast: Arc<BroadcastGroup>,
    collaborative: Arc<dyn CollaborativeStore>,
    storage: Option<Arc<WorkspaceStore>>,
    advisor: RwLock<DomainIndexAdvisor>,
    /// Domains named by index overrides, checked even without schema classes.
    configured_domains: BTreeSet<Domain>,
    pipeline: TriggerPipeline,
    forwarder: JoinHandle<()>,
    /// Serializes read-merge-write of collaborative content.
    collaborative_lock: Mutex<()>,
}

impl Workspace {
    /// Open `id`, recovering it from `store` when one is given.
    pub async fn open(
        id: WorkspaceId,
        store: Option<&Arc<DomainStore>>,
        settings: &WorkspaceSettings,
    ) -> Result<Self, ServerError> {
        let schema = settings.schema.clone();
        let db = Arc::new(MemoryDb::new(schema.clone()));
        let storage = store.map(|s| Arc::new(s.workspace(&id, schema.clone())));

        let mut tx_log = MemoryTxLog::new(db.clone(), settings.log_capacity);
        let collaborative: Arc<dyn CollaborativeStore> = match &storage {
            Some(storage) => {
                let docs = storage.load_documents()?;
                let recovered = db.load(docs).await;
                let next_sequence = storage.recover_sequence()?;
                log::info!(
                    "Recovered workspace {id}: {recovered} documents, next sequence {next_sequence}"
                );
                tx_log = tx_log
                    .with_sink(storage.clone() as Arc<dyn LogSink>)
                    .starting_at(next_sequence);
                storage.clone()
            }
            None => Arc::new(MemoryCollaborativeStore::new()),
        };
        let tx_log = Arc::new(tx_log);

        let trigger_store: Arc<dyn TriggerStore> = db.clone();
        let providers: Vec<Arc<dyn NotificationProvider>> = vec![
            Arc::new(InboxProvider) as Arc<dyn NotificationProvider>,
            Arc::new(EmailProvider::new(
                settings.email.clone(),
                trigger_store.clone(),
                TemplateRegistry::default(),
            )) as Arc<dyn NotificationProvider>,
        ];
        let rules = Arc::new(PreferenceRules::new(settings.notifications.clone(), schema.clone()));
        let dispatcher = MentionDispatcher::new(schema.clone(), trigger_store.clone(), rules, providers);
        let trigger = Arc::new(ReferenceTrigger::new(
            schema.clone(),
            trigger_store,
            collaborative.clone(),
            dispatcher,
        ));
        let pipeline = TriggerPipeline::spawn(
            trigger,
            tx_log.clone() as Arc<dyn TransactionLog>,
            settings.pipeline.clone(),
        )?;

        let broadcast = Arc::new(BroadcastGroup::new(
            settings.broadcast_capacity,
            settings.max_sessions,
        ));
        let forwarder = spawn_forwarder(id.clone(), tx_log.subscribe(), broadcast.clone());

        let configured_domains = settings.indexes.iter().map(|c| c.domain.clone()).collect();
        let advisor = DomainIndexAdvisor::new(schema.as_ref(), settings.indexes.clone());

        let workspace = Self {
            id,
            schema: RwLock::new(schema),
            db,
            tx_log,
            broadcast,
            collaborative,
            storage,
            advisor: RwLock::new(advisor),
            configured_domains,
            pipeline,
            forwarder,
            collaborative_lock: Mutex::new(()),
        };
        workspace.check_indexes().await;
        Ok(workspace)
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    pub fn db(&self) -> &Arc<MemoryDb> {
        &self.db
    }

    pub fn tx_log(&self) -> &Arc<MemoryTxLog> {
        &self.tx_log
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn storage(&self) -> Option<&Arc<WorkspaceStore>> {
        self.storage.as_ref()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Subscribe a session to committed transactions.
    pub async fn join(&self, info: SessionInfo) -> Result<broadcast::Receiver<TxBatch>, ServerError> {
        self.broadcast.join(info, self.id.as_str()).await
    }

    pub async fn leave(&self, info: &SessionInfo) {
        self.broadcast.leave(&info.session_id).await;
    }

    /// Commit `txs` atomically. Returns the sequence of the last entry.
    pub async fn apply(&self, txs: Vec<Tx>) -> Result<u64, ServerError> {
        Ok(self.tx_log.apply(txs).await?)
    }

    /// Documents of `params.class` matching the query, with the documents
    /// referenced through `params.lookup` attributes.
    pub async fn find_all(&self, params: &FindParams) -> Result<FindResult, ServerError> {
        let mut docs = self.db.find(&params.class, &params.query).await?;
        let total = docs.len() as u64;
        if let Some(limit) = params.limit {
            docs.truncate(limit);
        }

        let mut result = FindResult {
            total,
            ..FindResult::default()
        };
        for doc in &docs {
            for attribute in &params.lookup {
                let targets = doc
                    .doc_id_attr(attribute)
                    .into_iter()
                    .chain(doc.doc_ids_attr(attribute));
                for target in targets {
                    if result.lookup_map.contains_key(&target) {
                        continue;
                    }
                    if let Some(found) = self.db.get(target).await? {
                        result.lookup_map.insert(target, found);
                    }
                }
            }
        }
        result.docs = docs;
        Ok(result)
    }

    pub async fn load_collaborative(
        &self,
        reference: &CollaborativeRef,
    ) -> Result<Option<Vec<u8>>, ServerError> {
        Ok(self.collaborative.load(reference).await?)
    }

    /// Merge a yrs update into the stored content of `reference`, then
    /// commit an update of the owning document so triggers re-read it.
    ///
    /// Returns the sequence of that update, or `None` when the document is
    /// unknown.
    pub async fn update_collaborative(
        &self,
        reference: &CollaborativeRef,
        update: &[u8],
    ) -> Result<Option<u64>, ServerError> {
        {
            let _guard = self.collaborative_lock.lock().await;
            let current = self.collaborative.load(reference).await?;
            let merged = merge_update(current.as_deref(), update)?;
            self.collaborative.save(reference, &merged).await?;
        }

        let Some(doc) = self.db.get(reference.doc_id).await? else {
            log::debug!(
                "Collaborative update for unknown document {} in {}",
                reference.doc_id,
                self.id
            );
            return Ok(None);
        };
        let mut operations = Attributes::new();
        operations.insert(reference.attribute.clone(), Value::String(reference.key()));
        let tx = TxFactory::new(SYSTEM_ACCOUNT).update_doc(doc.class, doc.space, doc.id, operations);
        Ok(Some(self.apply(vec![tx]).await?))
    }

    /// Run the index advisor over every known domain.
    ///
    /// Returns the domains whose collection is in use.
    pub async fn check_indexes(&self) -> Vec<Domain> {
        let Some(storage) = &self.storage else {
            return Vec::new();
        };
        let advisor = self.advisor.read().await;
        let domains: BTreeSet<&Domain> = advisor.domains().chain(&self.configured_domains).collect();
        let mut active = Vec::new();
        for domain in domains {
            match advisor.check_domain(domain, false, storage.as_ref()).await {
                Ok(true) => active.push(domain.clone()),
                Ok(false) => {}
                Err(e) => log::error!("Index check of {}/{domain} failed: {e}", self.id),
            }
        }
        log::debug!("Index check of {} done, {} active domains", self.id, active.len());
        active
    }

    /// Install `schema`, recompute the desired indexes from it and re-check
    /// every domain.
    pub async fn on_schema_change(&self, schema: Arc<dyn SchemaDescriptor>) -> Vec<Domain> {
        self.advisor.write().await.rebuild(schema.as_ref());
        *self.schema.write().await = schema;
        log::info!("Schema of {} changed, re-checking indexes", self.id);
        self.check_indexes().await
    }

    pub async fn schema(&self) -> Arc<dyn SchemaDescriptor> {
        self.schema.read().await.clone()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Forward committed log entries to the sessions, one batch per wakeup.
fn spawn_forwarder(
    id: WorkspaceId,
    mut entries: broadcast::Receiver<Arc<strand_core::LogEntry>>,
    group: Arc<BroadcastGroup>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let first = match entries.recv().await {
                Ok(entry) => entry,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Broadcast forwarder of {id} lagged, {n} transactions not sent");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let mut batch = vec![first.tx.clone()];
            while let Ok(entry) = entries.try_recv() {
                batch.push(entry.tx.clone());
            }
            let receivers = group.publish(Arc::new(batch));
            log::trace!("Forwarded batch to {receivers} sessions of {id}");
        }
    })
}

/// Open workspaces by name.
pub struct WorkspaceRegistry {
    workspaces: RwLock<HashMap<WorkspaceId, Arc<Workspace>>>,
    store: Option<Arc<DomainStore>>,
    settings: WorkspaceSettings,
}

impl WorkspaceRegistry {
    pub fn new(store: Option<Arc<DomainStore>>, settings: WorkspaceSettings) -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
            store,
            settings,
        }
    }

    /// Get the workspace, opening it on first use.
    pub async fn get_or_open(&self, id: &WorkspaceId) -> Result<Arc<Workspace>, ServerError> {
        {
            let workspaces = self.workspaces.read().await;
            if let Some(ws) = workspaces.get(id) {
                return Ok(ws.clone());
            }
        }

        let mut workspaces = self.workspaces.write().await;
        if let Some(ws) = workspaces.get(id) {
            return Ok(ws.clone());
        }

        let ws = Arc::new(Workspace::open(id.clone(), self.store.as_ref(), &self.settings).await?);
        workspaces.insert(id.clone(), ws.clone());
        log::info!("Workspace {id} opened");
        Ok(ws)
    }

    pub async fn get(&self, id: &WorkspaceId) -> Option<Arc<Workspace>> {
        self.workspaces.read().await.get(id).cloned()
    }

    pub async fn workspace_count(&self) -> usize {
        self.workspaces.read().await.len()
    }

    /// Re-run the index advisor of every open workspace against `schema`.
    pub async fn on_schema_change(&self, schema: Arc<dyn SchemaDescriptor>) {
        let open: Vec<Arc<Workspace>> = self.workspaces.read().await.values().cloned().collect();
        for ws in open {
            ws.on_schema_change(schema.clone()).await;
        }
    }

    pub fn store(&self) -> Option<&Arc<DomainStore>> {
        self.store.as_ref()
    }
}
