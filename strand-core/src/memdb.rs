//! In-memory document store.
//!
//! Batches are applied all-or-nothing: every transaction is first replayed
//! onto an overlay, the resulting [`ChangeSet`] is offered to the caller
//! (persistence hooks in here), and only then merged into the live map.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::ids::{ClassId, DocId};
use crate::schema::SchemaDescriptor;
use crate::store::{Query, TriggerStore};
use crate::tx::{Doc, Tx, TxBody};

/// Documents written and removed by one batch.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub upserted: Vec<Doc>,
    /// Last known state of each removed document.
    pub removed: Vec<Doc>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }
}

pub struct MemoryDb {
    schema: Arc<dyn SchemaDescriptor>,
    docs: RwLock<HashMap<DocId, Doc>>,
}

impl MemoryDb {
    pub fn new(schema: Arc<dyn SchemaDescriptor>) -> Self {
        Self {
            schema,
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn schema(&self) -> &Arc<dyn SchemaDescriptor> {
        &self.schema
    }

    /// Seed documents recovered from persistent storage.
    pub async fn load(&self, docs: impl IntoIterator<Item = Doc>) -> usize {
        let mut map = self.docs.write().await;
        let before = map.len();
        for doc in docs {
            map.insert(doc.id, doc);
        }
        map.len() - before
    }

    pub async fn apply(&self, txs: &[Tx]) -> CoreResult<ChangeSet> {
        self.apply_with(txs, |_| Ok(())).await
    }

    /// Apply `txs` atomically. `before_commit` runs once the batch is known
    /// to be valid; an error from it discards the batch.
    pub async fn apply_with<F>(&self, txs: &[Tx], before_commit: F) -> CoreResult<ChangeSet>
    where
        F: FnOnce(&ChangeSet) -> CoreResult<()>,
    {
        let mut docs = self.docs.write().await;
        let mut overlay: HashMap<DocId, Option<Doc>> = HashMap::new();

        for tx in txs {
            Self::stage(&docs, &mut overlay, tx)?;
        }

        let mut changes = ChangeSet::default();
        for (id, staged) in &overlay {
            match staged {
                Some(doc) => changes.upserted.push(doc.clone()),
                None => {
                    if let Some(old) = docs.get(id) {
                        changes.removed.push(old.clone());
                    }
                }
            }
        }

        before_commit(&changes)?;

        for (id, staged) in overlay {
            match staged {
                Some(doc) => {
                    docs.insert(id, doc);
                }
                None => {
                    docs.remove(&id);
                }
            }
        }
        Ok(changes)
    }

    fn stage(
        docs: &HashMap<DocId, Doc>,
        overlay: &mut HashMap<DocId, Option<Doc>>,
        tx: &Tx,
    ) -> CoreResult<()> {
        let current = |overlay: &HashMap<DocId, Option<Doc>>, id: &DocId| -> Option<Doc> {
            match overlay.get(id) {
                Some(staged) => staged.clone(),
                None => docs.get(id).cloned(),
            }
        };

        if let Some(doc) = Doc::from_create(tx) {
            if current(overlay, &doc.id).is_some() {
                return Err(CoreError::DuplicateDocument(doc.id));
            }
            overlay.insert(doc.id, Some(doc));
            return Ok(());
        }

        let inner = tx.extract();
        match &inner.body {
            TxBody::Update { .. } | TxBody::Mixin { .. } => {
                let mut doc = current(overlay, &inner.object_id)
                    .ok_or(CoreError::DocumentNotFound(inner.object_id))?;
                doc.apply(inner);
                overlay.insert(doc.id, Some(doc));
            }
            TxBody::Remove => {
                if current(overlay, &inner.object_id).is_some() {
                    overlay.insert(inner.object_id, None);
                } else {
                    log::debug!("Remove of unknown document {} ignored", inner.object_id);
                }
            }
            TxBody::Create { .. } | TxBody::Collection { .. } => {
                return Err(CoreError::InvalidTx(format!(
                    "malformed transaction {}",
                    tx.id
                )));
            }
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    /// Every document, oldest first.
    pub async fn all(&self) -> Vec<Doc> {
        let mut all: Vec<Doc> = self.docs.read().await.values().cloned().collect();
        sort_docs(&mut all);
        all
    }
}

fn sort_docs(docs: &mut [Doc]) {
    docs.sort_by(|a, b| a.modified_on.cmp(&b.modified_on).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl TriggerStore for MemoryDb {
    async fn find(&self, class: &ClassId, query: &Query) -> CoreResult<Vec<Doc>> {
        let docs = self.docs.read().await;
        let mut found: Vec<Doc> = docs
            .values()
            .filter(|doc| self.schema.is_derived(&doc.class, class) && query.matches(doc))
            .cloned()
            .collect();
        sort_docs(&mut found);
        Ok(found)
    }

    async fn get(&self, id: DocId) -> CoreResult<Option<Doc>> {
        Ok(self.docs.read().await.get(&id).cloned())
    }
}
