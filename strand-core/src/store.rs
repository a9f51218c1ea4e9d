//! Read-side contracts used by triggers: document lookups and
//! collaborative content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::CoreResult;
use crate::ids::{ClassId, DocId};
use crate::tx::Doc;

/// Equality filter over document fields. A scalar condition also matches
/// an array field that contains it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(pub BTreeMap<String, Value>);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.0.insert(field.to_string(), value);
        self
    }

    pub fn matches(&self, doc: &Doc) -> bool {
        self.0.iter().all(|(field, expected)| match doc.field(field) {
            Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
            Some(actual) => &actual == expected,
            None => expected.is_null(),
        })
    }
}

#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Documents of `class` (or a descendant) matching `query`.
    async fn find(&self, class: &ClassId, query: &Query) -> CoreResult<Vec<Doc>>;

    async fn get(&self, id: DocId) -> CoreResult<Option<Doc>>;

    async fn find_one(&self, class: &ClassId, query: &Query) -> CoreResult<Option<Doc>> {
        Ok(self.find(class, query).await?.into_iter().next())
    }
}

/// Address of one collaborative attribute's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborativeRef {
    pub doc_id: DocId,
    pub attribute: String,
}

impl CollaborativeRef {
    pub fn new(doc_id: DocId, attribute: impl Into<String>) -> Self {
        Self {
            doc_id,
            attribute: attribute.into(),
        }
    }

    /// Stable storage key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.doc_id, self.attribute)
    }
}

/// Storage for collaborative documents (yrs state updates).
#[async_trait]
pub trait CollaborativeStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    async fn load(&self, key: &CollaborativeRef) -> CoreResult<Option<Vec<u8>>>;

    async fn save(&self, key: &CollaborativeRef, content: &[u8]) -> CoreResult<()>;
}

#[derive(Default)]
pub struct MemoryCollaborativeStore {
    blobs: RwLock<HashMap<CollaborativeRef, Vec<u8>>>,
}

impl MemoryCollaborativeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CollaborativeStore for MemoryCollaborativeStore {
    async fn load(&self, key: &CollaborativeRef) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn save(&self, key: &CollaborativeRef, content: &[u8]) -> CoreResult<()> {
        self.blobs.write().await.insert(key.clone(), content.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::class;
    use serde_json::json;

    #[test]
    fn test_query_matches_header_and_attributes() {
        let owner = DocId::new();
        let mut doc = Doc::new(DocId::new(), class::USER_MENTION_INFO, DocId::nil())
            .with_attribute("user", "u1");
        doc.attached_to = Some(owner);

        assert!(Query::new().eq("attachedTo", owner).matches(&doc));
        assert!(Query::new().eq("attachedTo", owner).eq("user", "u1").matches(&doc));
        assert!(!Query::new().eq("user", "u2").matches(&doc));
        assert!(!Query::new().eq("collection", "mentions").matches(&doc));
    }

    #[test]
    fn test_query_scalar_matches_array_member() {
        let doc = Doc::new(DocId::new(), class::SPACE, DocId::nil())
            .with_attribute("members", json!(["a", "b"]));
        assert!(Query::new().eq("members", "b").matches(&doc));
        assert!(!Query::new().eq("members", "c").matches(&doc));
    }

    #[tokio::test]
    async fn test_memory_collaborative_store() {
        let store = MemoryCollaborativeStore::new();
        let key = CollaborativeRef::new(DocId::new(), "description");
        assert!(store.load(&key).await.unwrap().is_none());
        store.save(&key, &[1, 2, 3]).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(vec![1, 2, 3]));
    }
}
