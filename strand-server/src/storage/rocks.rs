//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`    : documents keyed by `workspace/domain/id` (LZ4 JSON)
//! - `collections`  : one marker per existing `workspace/domain`
//! - `indexes`      : index catalog keyed by `workspace/domain/name`
//! - `index_entries`: `workspace/domain/name/values/id`, empty values
//! - `collaborative`: yrs state per `workspace/doc:attribute` (LZ4)
//! - `txlog`        : committed entries keyed by `workspace/sequence`
//!
//! Key parts are joined with a zero byte. Sequence numbers are big-endian
//! so the log sorts in commit order.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use strand_core::{
    ChangeSet, CollaborativeRef, CollaborativeStore, CoreError, CoreResult, Doc, DocId, Domain,
    IndexSpec, LogEntry, LogSink, SchemaDescriptor, WorkspaceId,
};

use super::advisor::{DomainOperations, IndexInfo, PRIMARY_INDEX};

const CF_DOCUMENTS: &str = "documents";
const CF_COLLECTIONS: &str = "collections";
const CF_INDEXES: &str = "indexes";
const CF_INDEX_ENTRIES: &str = "index_entries";
const CF_COLLABORATIVE: &str = "collaborative";
const CF_TXLOG: &str = "txlog";

const COLUMN_FAMILIES: &[&str] = &[
    CF_DOCUMENTS,
    CF_COLLECTIONS,
    CF_INDEXES,
    CF_INDEX_ENTRIES,
    CF_COLLABORATIVE,
    CF_TXLOG,
];

const SEP: u8 = 0;

/// Domain of documents whose class declares none.
pub const DEFAULT_DOMAIN: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes.
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every batch.
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family.
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("strand_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("Column family '{0}' not found")]
    MissingColumnFamily(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] lz4_flex::block::DecompressError),

    #[error("Corrupt log entry at sequence {0}")]
    CorruptEntry(u64),

    #[error("{0}")]
    Invalid(String),
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Storage(e.to_string())
    }
}

type KeyValue = (Box<[u8]>, Box<[u8]>);

/// One RocksDB instance shared by all workspaces.
pub struct DomainStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DomainStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_INDEX_ENTRIES => {
                // Written on every commit, scanned by domain.
                opts.set_max_write_buffer_number(4);
            }
            CF_COLLECTIONS | CF_COLLABORATIVE => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_INDEXES => {
                opts.set_max_write_buffer_number(2);
            }
            CF_TXLOG => {
                // Appended in order, read back only on recovery.
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// View of one workspace. `schema` resolves document domains.
    pub fn workspace(
        self: &Arc<Self>,
        workspace: &WorkspaceId,
        schema: Arc<dyn SchemaDescriptor>,
    ) -> WorkspaceStore {
        WorkspaceStore {
            store: self.clone(),
            prefix: key(&[workspace.as_str().as_bytes()]),
            workspace: workspace.clone(),
            schema,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::MissingColumnFamily(name.to_string()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    /// Up to `limit` entries whose key starts with `prefix`, in key order.
    fn scan(&self, cf_name: &str, prefix: &[u8], limit: usize) -> Result<Vec<KeyValue>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut found = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (k, v) = item?;
            if !k.starts_with(prefix) || found.len() >= limit {
                break;
            }
            found.push((k, v));
        }
        Ok(found)
    }

    /// Last entry whose key starts with `prefix`.
    fn last(&self, cf_name: &str, prefix: &[u8]) -> Result<Option<KeyValue>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut upper = prefix.to_vec();
        if let Some(last) = upper.last_mut() {
            *last += 1;
        }
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (k, v) = item?;
                Ok(k.starts_with(prefix).then_some((k, v)))
            }
            None => Ok(None),
        }
    }
}

/// Zero-separated key with a trailing separator, usable as a scan prefix.
fn key(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        out.extend_from_slice(part);
        out.push(SEP);
    }
    out
}

fn compress_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&serde_json::to_vec(value)?))
}

fn decompress_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// The part of the store that belongs to one workspace.
pub struct WorkspaceStore {
    store: Arc<DomainStore>,
    workspace: WorkspaceId,
    /// `workspace` + separator; every key of this view starts with it.
    prefix: Vec<u8>,
    schema: Arc<dyn SchemaDescriptor>,
}

impl WorkspaceStore {
    pub fn workspace(&self) -> &WorkspaceId {
        &self.workspace
    }

    pub fn domain_of(&self, doc: &Doc) -> Domain {
        self.schema
            .domain_of(&doc.class)
            .unwrap_or_else(|| Domain::new(DEFAULT_DOMAIN))
    }

    fn key(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend(key(parts));
        out
    }

    fn collection_key(&self, domain: &Domain) -> Vec<u8> {
        self.key(&[domain.as_str().as_bytes()])
    }

    fn doc_key(&self, domain: &Domain, id: DocId) -> Vec<u8> {
        self.key(&[domain.as_str().as_bytes(), &id.as_bytes()[..]])
    }

    fn index_key(&self, domain: &Domain, name: &str) -> Vec<u8> {
        self.key(&[domain.as_str().as_bytes(), name.as_bytes()])
    }

    fn entry_key(&self, domain: &Domain, index: &IndexInfo, doc: &Doc) -> Result<Option<Vec<u8>>, StoreError> {
        let values: Vec<Value> = index
            .index
            .keys
            .iter()
            .map(|k| doc.field(&k.field).unwrap_or(Value::Null))
            .collect();
        if index.index.sparse && values.iter().all(Value::is_null) {
            return Ok(None);
        }
        let encoded = serde_json::to_vec(&values)?;
        Ok(Some(self.key(&[
            domain.as_str().as_bytes(),
            index.name.as_bytes(),
            &encoded,
            &doc.id.as_bytes()[..],
        ])))
    }

    fn log_key(&self, sequence: u64) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend_from_slice(&sequence.to_be_bytes());
        out
    }

    fn collaborative_key(&self, reference: &CollaborativeRef) -> Vec<u8> {
        self.key(&[reference.key().as_bytes()])
    }

    /// Every stored document of the workspace.
    pub fn load_documents(&self) -> Result<Vec<Doc>, StoreError> {
        self.store
            .scan(CF_DOCUMENTS, &self.prefix, usize::MAX)?
            .into_iter()
            .map(|(_, v)| decompress_json(&v))
            .collect()
    }

    /// Sequence number the next committed entry should get.
    pub fn recover_sequence(&self) -> Result<u64, StoreError> {
        let Some((k, _)) = self.store.last(CF_TXLOG, &self.prefix)? else {
            return Ok(0);
        };
        let Some(tail) = k.len().checked_sub(8).map(|start| &k[start..]) else {
            return Ok(0);
        };
        let mut buf = [0u8; 8];
        buf.copy_from_slice(tail);
        Ok(u64::from_be_bytes(buf) + 1)
    }

    /// Committed entries from `since` on, checksums verified.
    pub fn log_entries(&self, since: u64) -> Result<Vec<LogEntry>, StoreError> {
        let cf = self.store.cf(CF_TXLOG)?;
        let start = self.log_key(since);
        let mut entries = Vec::new();
        for item in self
            .store
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (k, v) = item?;
            if !k.starts_with(&self.prefix) {
                break;
            }
            let entry: LogEntry = decompress_json(&v)?;
            if !entry.verify() {
                return Err(StoreError::CorruptEntry(entry.sequence));
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Ids found in index `name` of `domain`, in index order.
    pub fn index_entries(&self, domain: &Domain, name: &str) -> Result<Vec<DocId>, StoreError> {
        let prefix = self.index_key(domain, name);
        Ok(self
            .store
            .scan(CF_INDEX_ENTRIES, &prefix, usize::MAX)?
            .into_iter()
            .filter_map(|(k, _)| {
                let start = k.len().checked_sub(17)?;
                let bytes: [u8; 16] = k[start..start + 16].try_into().ok()?;
                Some(DocId(uuid::Uuid::from_bytes(bytes)))
            })
            .collect())
    }

    fn catalog(&self, domain: &Domain) -> Result<Vec<IndexInfo>, StoreError> {
        let prefix = self.collection_key(domain);
        self.store
            .scan(CF_INDEXES, &prefix, usize::MAX)?
            .into_iter()
            .map(|(_, v)| Ok(serde_json::from_slice(&v)?))
            .collect()
    }

    fn stored_doc(&self, domain: &Domain, id: DocId) -> Result<Option<Doc>, StoreError> {
        self.store
            .get(CF_DOCUMENTS, &self.doc_key(domain, id))?
            .map(|bytes| decompress_json(&bytes))
            .transpose()
    }

    fn write_changes(&self, entries: &[LogEntry], changes: &ChangeSet) -> Result<(), StoreError> {
        let cf_docs = self.store.cf(CF_DOCUMENTS)?;
        let cf_collections = self.store.cf(CF_COLLECTIONS)?;
        let cf_entries = self.store.cf(CF_INDEX_ENTRIES)?;
        let cf_log = self.store.cf(CF_TXLOG)?;

        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(&cf_log, self.log_key(entry.sequence), compress_json(entry)?);
        }

        let mut catalogs: HashMap<Domain, Vec<IndexInfo>> = HashMap::new();
        for doc in &changes.removed {
            let domain = self.domain_of(doc);
            if !catalogs.contains_key(&domain) {
                catalogs.insert(domain.clone(), self.catalog(&domain)?);
            }
            for index in catalogs.get(&domain).into_iter().flatten() {
                if let Some(k) = self.entry_key(&domain, index, doc)? {
                    batch.delete_cf(&cf_entries, k);
                }
            }
            batch.delete_cf(&cf_docs, self.doc_key(&domain, doc.id));
        }

        for doc in &changes.upserted {
            let domain = self.domain_of(doc);
            if !catalogs.contains_key(&domain) {
                catalogs.insert(domain.clone(), self.catalog(&domain)?);
            }
            let previous = self.stored_doc(&domain, doc.id)?;
            for index in catalogs.get(&domain).into_iter().flatten() {
                if let Some(old) = &previous {
                    if let Some(k) = self.entry_key(&domain, index, old)? {
                        batch.delete_cf(&cf_entries, k);
                    }
                }
                if let Some(k) = self.entry_key(&domain, index, doc)? {
                    batch.put_cf(&cf_entries, k, []);
                }
            }
            batch.put_cf(&cf_docs, self.doc_key(&domain, doc.id), compress_json(doc)?);
            batch.put_cf(&cf_collections, self.collection_key(&domain), []);
        }

        self.store.write(batch)
    }
}

impl LogSink for WorkspaceStore {
    fn persist(&self, entries: &[LogEntry], changes: &ChangeSet) -> CoreResult<()> {
        self.write_changes(entries, changes)?;
        log::trace!(
            "Persisted {} entries ({} upserted, {} removed) for {}",
            entries.len(),
            changes.upserted.len(),
            changes.removed.len(),
            self.workspace
        );
        Ok(())
    }
}

#[async_trait]
impl CollaborativeStore for WorkspaceStore {
    async fn load(&self, reference: &CollaborativeRef) -> CoreResult<Option<Vec<u8>>> {
        let Some(bytes) = self.store.get(CF_COLLABORATIVE, &self.collaborative_key(reference))? else {
            return Ok(None);
        };
        let content = lz4_flex::decompress_size_prepended(&bytes).map_err(StoreError::from)?;
        Ok(Some(content))
    }

    async fn save(&self, reference: &CollaborativeRef, content: &[u8]) -> CoreResult<()> {
        let cf = self.store.cf(CF_COLLABORATIVE)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf,
            self.collaborative_key(reference),
            lz4_flex::compress_prepend_size(content),
        );
        self.store.write(batch)?;
        Ok(())
    }
}

#[async_trait]
impl DomainOperations for WorkspaceStore {
    async fn exists(&self, domain: &Domain) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(CF_COLLECTIONS, &self.collection_key(domain))?
            .is_some())
    }

    async fn create(&self, domain: &Domain) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_COLLECTIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, self.collection_key(domain), []);
        self.store.write(batch)
    }

    async fn has_documents(&self, domain: &Domain, count: usize) -> Result<bool, StoreError> {
        let prefix = self.collection_key(domain);
        Ok(self.store.scan(CF_DOCUMENTS, &prefix, count)?.len() >= count)
    }

    async fn list_indexes(&self, domain: &Domain) -> Result<Vec<IndexInfo>, StoreError> {
        if !self.exists(domain).await? {
            return Ok(Vec::new());
        }
        let mut indexes = vec![IndexInfo::primary()];
        indexes.extend(self.catalog(domain)?);
        Ok(indexes)
    }

    async fn create_index(&self, domain: &Domain, index: &IndexSpec, name: &str) -> Result<(), StoreError> {
        let info = IndexInfo {
            name: name.to_string(),
            index: index.to_field_index(),
        };
        let cf_indexes = self.store.cf(CF_INDEXES)?;
        let cf_entries = self.store.cf(CF_INDEX_ENTRIES)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_indexes, self.index_key(domain, name), serde_json::to_vec(&info)?);
        let mut entries = 0usize;
        for (_, v) in self.store.scan(CF_DOCUMENTS, &self.collection_key(domain), usize::MAX)? {
            let doc: Doc = decompress_json(&v)?;
            if let Some(k) = self.entry_key(domain, &info, &doc)? {
                batch.put_cf(&cf_entries, k, []);
                entries += 1;
            }
        }
        self.store.write(batch)?;
        log::debug!("Built index {name} on {}/{domain} with {entries} entries", self.workspace);
        Ok(())
    }

    async fn drop_index(&self, domain: &Domain, name: &str) -> Result<(), StoreError> {
        if name == PRIMARY_INDEX {
            return Err(StoreError::Invalid("the primary index cannot be dropped".into()));
        }
        let cf_indexes = self.store.cf(CF_INDEXES)?;
        let cf_entries = self.store.cf(CF_INDEX_ENTRIES)?;

        let index_key = self.index_key(domain, name);
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_indexes, &index_key);
        for (k, _) in self.store.scan(CF_INDEX_ENTRIES, &index_key, usize::MAX)? {
            batch.delete_cf(&cf_entries, k);
        }
        self.store.write(batch)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::advisor::{index_name, DomainIndexAdvisor};
    use serde_json::json;
    use strand_core::{
        class, AttributeDef, Attributes, ClassDef, ClassId, FieldIndex, Hierarchy, IndexKey,
        IndexKind, MemoryDb, MemoryTxLog, TransactionLog, TxFactory, TypeKind,
    };
    use tempfile::TempDir;

    const ISSUE: ClassId = ClassId::from_static("tracker:class:Issue");

    fn schema() -> Arc<Hierarchy> {
        let mut h = Hierarchy::platform();
        h.add(
            ClassDef::new(ISSUE)
                .extends(class::DOC)
                .domain("tracker")
                .attribute(AttributeDef::new("status", TypeKind::String).indexed(IndexKind::Indexed)),
        );
        Arc::new(h)
    }

    fn open(dir: &TempDir) -> Arc<DomainStore> {
        Arc::new(DomainStore::open(StoreConfig::for_testing(dir.path())).unwrap())
    }

    fn view(store: &Arc<DomainStore>, workspace: &str) -> Arc<WorkspaceStore> {
        Arc::new(store.workspace(&WorkspaceId::new(workspace), schema()))
    }

    fn tx_log(view: &Arc<WorkspaceStore>) -> MemoryTxLog {
        let db = Arc::new(MemoryDb::new(schema()));
        MemoryTxLog::new(db, 64)
            .with_sink(view.clone())
            .starting_at(view.recover_sequence().unwrap())
    }

    fn status(value: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("status".into(), json!(value));
        attrs
    }

    fn tracker() -> Domain {
        Domain::new("tracker")
    }

    #[test]
    fn test_store_open_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            for name in COLUMN_FAMILIES {
                assert!(store.cf(name).is_ok());
            }
        }
        let store = open(&dir);
        assert_eq!(view(&store, "ws").recover_sequence().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commits_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let f = TxFactory::new(DocId::new());
        let kept = DocId::new();
        let removed = DocId::new();
        let expected = {
            let store = open(&dir);
            let ws = view(&store, "ws");
            let log = tx_log(&ws);
            log.apply(vec![
                f.create_doc(ISSUE, DocId::nil(), kept, status("open")),
                f.create_doc(ISSUE, DocId::nil(), removed, status("open")),
            ])
            .await
            .unwrap();
            log.apply(vec![f.update_doc(ISSUE, DocId::nil(), kept, status("done"))])
                .await
                .unwrap();
            log.apply(vec![f.remove_doc(ISSUE, DocId::nil(), removed)])
                .await
                .unwrap();
            log.db().all().await
        };

        let store = open(&dir);
        let ws = view(&store, "ws");
        let docs = ws.load_documents().unwrap();
        assert_eq!(docs, expected);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].str_attr("status"), Some("done"));

        assert_eq!(ws.recover_sequence().unwrap(), 4);
        let entries = ws.log_entries(0).unwrap();
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(ws.log_entries(3).unwrap().len(), 1);

        let log = tx_log(&ws);
        assert_eq!(log.next_sequence(), 4);
    }

    #[tokio::test]
    async fn test_workspaces_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let a = view(&store, "a");
        let b = view(&store, "ab");
        let f = TxFactory::new(DocId::new());

        tx_log(&a)
            .apply(vec![f.create_doc(ISSUE, DocId::nil(), DocId::new(), status("open"))])
            .await
            .unwrap();

        assert_eq!(a.load_documents().unwrap().len(), 1);
        assert!(b.load_documents().unwrap().is_empty());
        assert_eq!(b.recover_sequence().unwrap(), 0);
        assert!(!b.exists(&tracker()).await.unwrap());
        assert!(a.exists(&tracker()).await.unwrap());
    }

    #[tokio::test]
    async fn test_index_entries_follow_documents() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let ws = view(&store, "ws");
        let log = tx_log(&ws);
        let f = TxFactory::new(DocId::new());
        let first = DocId::new();
        let second = DocId::new();
        log.apply(vec![f.create_doc(ISSUE, DocId::nil(), first, status("b"))])
            .await
            .unwrap();

        let spec = IndexSpec::Keys(FieldIndex::single(IndexKey::asc("status")));
        ws.create_index(&tracker(), &spec, "status_1").await.unwrap();
        assert_eq!(ws.index_entries(&tracker(), "status_1").unwrap(), vec![first]);

        log.apply(vec![f.create_doc(ISSUE, DocId::nil(), second, status("a"))])
            .await
            .unwrap();
        assert_eq!(ws.index_entries(&tracker(), "status_1").unwrap(), vec![second, first]);

        log.apply(vec![f.update_doc(ISSUE, DocId::nil(), first, status("0"))])
            .await
            .unwrap();
        assert_eq!(ws.index_entries(&tracker(), "status_1").unwrap(), vec![first, second]);

        log.apply(vec![f.remove_doc(ISSUE, DocId::nil(), second)])
            .await
            .unwrap();
        assert_eq!(ws.index_entries(&tracker(), "status_1").unwrap(), vec![first]);

        let names: Vec<String> = ws
            .list_indexes(&tracker())
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["_id_", "status_1"]);

        ws.drop_index(&tracker(), "status_1").await.unwrap();
        assert!(ws.index_entries(&tracker(), "status_1").unwrap().is_empty());
        assert_eq!(ws.list_indexes(&tracker()).await.unwrap().len(), 1);
        assert!(ws.drop_index(&tracker(), PRIMARY_INDEX).await.is_err());
    }

    #[tokio::test]
    async fn test_sparse_index_skips_missing_fields() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let ws = view(&store, "ws");
        let f = TxFactory::new(DocId::new());
        tx_log(&ws)
            .apply(vec![
                f.create_doc(ISSUE, DocId::nil(), DocId::new(), status("open")),
                f.create_doc(ISSUE, DocId::nil(), DocId::new(), Attributes::new()),
            ])
            .await
            .unwrap();

        ws.create_index(&tracker(), &IndexSpec::Field("status".into()), "status_sp_1")
            .await
            .unwrap();
        assert_eq!(ws.index_entries(&tracker(), "status_sp_1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_domain_operations() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let ws = view(&store, "ws");
        let empty = Domain::new("empty");

        assert!(!ws.exists(&empty).await.unwrap());
        assert!(ws.list_indexes(&empty).await.unwrap().is_empty());
        ws.create(&empty).await.unwrap();
        assert!(ws.exists(&empty).await.unwrap());
        assert!(ws.has_documents(&empty, 0).await.unwrap());
        assert!(!ws.has_documents(&empty, 1).await.unwrap());

        let f = TxFactory::new(DocId::new());
        let log = tx_log(&ws);
        for _ in 0..3 {
            log.apply(vec![f.create_doc(ISSUE, DocId::nil(), DocId::new(), status("x"))])
                .await
                .unwrap();
        }
        assert!(ws.has_documents(&tracker(), 3).await.unwrap());
        assert!(!ws.has_documents(&tracker(), 4).await.unwrap());
    }

    #[tokio::test]
    async fn test_collaborative_content() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let ws = view(&store, "ws");
        let reference = CollaborativeRef::new(DocId::new(), "content");

        assert!(ws.load(&reference).await.unwrap().is_none());
        ws.save(&reference, &[7, 7, 7]).await.unwrap();
        assert_eq!(ws.load(&reference).await.unwrap(), Some(vec![7, 7, 7]));
        assert!(view(&store, "other").load(&reference).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advisor_builds_indexes_in_store() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let ws = view(&store, "ws");
        let log = tx_log(&ws);
        let f = TxFactory::new(DocId::new());
        let hierarchy = schema();
        let advisor = DomainIndexAdvisor::new(&*hierarchy, Vec::new());

        let txs = (0..10)
            .map(|i| f.create_doc(ISSUE, DocId::nil(), DocId::new(), status(&i.to_string())))
            .collect();
        log.apply(txs).await.unwrap();
        assert!(advisor.check_domain(&tracker(), false, ws.as_ref()).await.unwrap());
        assert_eq!(ws.list_indexes(&tracker()).await.unwrap().len(), 1);

        let txs = (0..45)
            .map(|i| f.create_doc(ISSUE, DocId::nil(), DocId::new(), status(&i.to_string())))
            .collect();
        log.apply(txs).await.unwrap();
        assert!(advisor.check_domain(&tracker(), false, ws.as_ref()).await.unwrap());

        let names: Vec<String> = ws
            .list_indexes(&tracker())
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        let expected: Vec<String> = advisor.desired(&tracker()).iter().map(index_name).collect();
        assert_eq!(names[1..], expected[..]);
        assert_eq!(ws.index_entries(&tracker(), "status_1").unwrap().len(), 55);
    }
}
