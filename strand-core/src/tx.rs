//! Transactions and the generic stored document they mutate.
//!
//! A [`Tx`] is an immutable record of one mutation. Attached documents
//! (messages, references, mention markers) are mutated through a
//! `Collection` transaction whose `object_id` names the collection owner
//! and whose inner transaction carries the actual create/update/remove.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::ids::{ClassId, DocId};

/// Attribute bag of a document or an update.
pub type Attributes = BTreeMap<String, Value>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Create,
    Update,
    Remove,
    CollectionCud,
    Mixin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TxBody {
    Create {
        attributes: Attributes,
    },
    Update {
        #[serde(default)]
        operations: Attributes,
        /// Values appended to array attributes.
        #[serde(default)]
        push: Attributes,
    },
    Remove,
    Collection {
        collection: String,
        tx: Box<Tx>,
    },
    Mixin {
        mixin: ClassId,
        #[serde(default)]
        attributes: Attributes,
        #[serde(default)]
        push: Attributes,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    #[serde(rename = "_id")]
    pub id: DocId,
    pub object_id: DocId,
    pub object_class: ClassId,
    pub space: DocId,
    pub modified_by: DocId,
    pub modified_on: i64,
    pub body: TxBody,
}

impl Tx {
    pub fn kind(&self) -> TxKind {
        match self.body {
            TxBody::Create { .. } => TxKind::Create,
            TxBody::Update { .. } => TxKind::Update,
            TxBody::Remove => TxKind::Remove,
            TxBody::Collection { .. } => TxKind::CollectionCud,
            TxBody::Mixin { .. } => TxKind::Mixin,
        }
    }

    /// Unwrap collection transactions down to the mutation they carry.
    pub fn extract(&self) -> &Tx {
        match &self.body {
            TxBody::Collection { tx, .. } => tx.extract(),
            _ => self,
        }
    }

    /// Attribute names written by an update (operations and pushes).
    pub fn touched_attributes(&self) -> Vec<&str> {
        match &self.extract().body {
            TxBody::Update { operations, push } => operations
                .keys()
                .chain(push.keys())
                .map(String::as_str)
                .collect(),
            TxBody::Mixin { attributes, push, .. } => attributes
                .keys()
                .chain(push.keys())
                .map(String::as_str)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The document actually mutated, looking through collection wrappers.
    pub fn routing_id(&self) -> DocId {
        self.extract().object_id
    }
}

/// Builds transactions on behalf of one account.
#[derive(Debug, Clone)]
pub struct TxFactory {
    account: DocId,
}

impl TxFactory {
    pub fn new(account: DocId) -> Self {
        Self { account }
    }

    pub fn account(&self) -> DocId {
        self.account
    }

    fn tx(&self, object_id: DocId, object_class: ClassId, space: DocId, body: TxBody) -> Tx {
        Tx {
            id: DocId::new(),
            object_id,
            object_class,
            space,
            modified_by: self.account,
            modified_on: now_millis(),
            body,
        }
    }

    pub fn create_doc(
        &self,
        class: ClassId,
        space: DocId,
        object_id: DocId,
        attributes: Attributes,
    ) -> Tx {
        self.tx(object_id, class, space, TxBody::Create { attributes })
    }

    pub fn update_doc(
        &self,
        class: ClassId,
        space: DocId,
        object_id: DocId,
        operations: Attributes,
    ) -> Tx {
        self.tx(
            object_id,
            class,
            space,
            TxBody::Update {
                operations,
                push: Attributes::new(),
            },
        )
    }

    /// Append `value` to the array attribute `attribute`.
    pub fn push(
        &self,
        class: ClassId,
        space: DocId,
        object_id: DocId,
        attribute: &str,
        value: Value,
    ) -> Tx {
        let mut push = Attributes::new();
        push.insert(attribute.to_string(), value);
        self.tx(
            object_id,
            class,
            space,
            TxBody::Update {
                operations: Attributes::new(),
                push,
            },
        )
    }

    pub fn remove_doc(&self, class: ClassId, space: DocId, object_id: DocId) -> Tx {
        self.tx(object_id, class, space, TxBody::Remove)
    }

    pub fn mixin(
        &self,
        object_id: DocId,
        object_class: ClassId,
        space: DocId,
        mixin: ClassId,
        attributes: Attributes,
    ) -> Tx {
        self.tx(
            object_id,
            object_class,
            space,
            TxBody::Mixin {
                mixin,
                attributes,
                push: Attributes::new(),
            },
        )
    }

    /// Append `value` to the array attribute `attribute` of a mixin.
    pub fn mixin_push(
        &self,
        object_id: DocId,
        object_class: ClassId,
        space: DocId,
        mixin: ClassId,
        attribute: &str,
        value: Value,
    ) -> Tx {
        let mut push = Attributes::new();
        push.insert(attribute.to_string(), value);
        self.tx(
            object_id,
            object_class,
            space,
            TxBody::Mixin {
                mixin,
                attributes: Attributes::new(),
                push,
            },
        )
    }

    /// Wrap `inner` so it applies to a document attached to `attached_to`.
    pub fn collection(
        &self,
        attached_to: DocId,
        attached_to_class: ClassId,
        space: DocId,
        collection: &str,
        inner: Tx,
    ) -> Tx {
        self.tx(
            attached_to,
            attached_to_class,
            space,
            TxBody::Collection {
                collection: collection.to_string(),
                tx: Box::new(inner),
            },
        )
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Doc {
    #[serde(rename = "_id")]
    pub id: DocId,
    #[serde(rename = "_class")]
    pub class: ClassId,
    pub space: DocId,
    pub modified_on: i64,
    pub modified_by: DocId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<DocId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to_class: Option<ClassId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mixins: BTreeMap<ClassId, Attributes>,
}

impl Doc {
    pub fn new(id: DocId, class: ClassId, space: DocId) -> Self {
        Self {
            id,
            class,
            space,
            modified_on: now_millis(),
            modified_by: DocId::nil(),
            attached_to: None,
            attached_to_class: None,
            collection: None,
            attributes: Attributes::new(),
            mixins: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Build the document a create transaction (plain or collection) produces.
    pub fn from_create(tx: &Tx) -> Option<Doc> {
        match &tx.body {
            TxBody::Create { attributes } => Some(Doc {
                id: tx.object_id,
                class: tx.object_class.clone(),
                space: tx.space,
                modified_on: tx.modified_on,
                modified_by: tx.modified_by,
                attached_to: None,
                attached_to_class: None,
                collection: None,
                attributes: attributes.clone(),
                mixins: BTreeMap::new(),
            }),
            TxBody::Collection { collection, tx: inner } => {
                let mut doc = Doc::from_create(inner)?;
                doc.attached_to = Some(tx.object_id);
                doc.attached_to_class = Some(tx.object_class.clone());
                doc.collection = Some(collection.clone());
                Some(doc)
            }
            _ => None,
        }
    }

    /// Apply an update or mixin transaction in place. Other kinds are ignored.
    pub fn apply(&mut self, tx: &Tx) {
        let tx = tx.extract();
        match &tx.body {
            TxBody::Update { operations, push } => {
                self.set_attributes(operations);
                push_all(&mut self.attributes, push);
            }
            TxBody::Mixin {
                mixin,
                attributes,
                push,
            } => {
                let target = self.mixins.entry(mixin.clone()).or_default();
                for (name, value) in attributes {
                    target.insert(name.clone(), value.clone());
                }
                push_all(target, push);
            }
            _ => return,
        }
        self.modified_on = tx.modified_on;
        self.modified_by = tx.modified_by;
    }

    /// Set attributes; a null value removes the attribute.
    pub fn set_attributes(&mut self, operations: &Attributes) {
        for (name, value) in operations {
            if value.is_null() {
                self.attributes.remove(name);
            } else {
                self.attributes.insert(name.clone(), value.clone());
            }
        }
    }

    /// Resolve a query field. Underscore-prefixed and structural fields map
    /// to the header, anything else to the attribute bag.
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "_id" => Some(Value::String(self.id.to_string())),
            "_class" => Some(Value::String(self.class.to_string())),
            "space" => Some(Value::String(self.space.to_string())),
            "modifiedBy" => Some(Value::String(self.modified_by.to_string())),
            "modifiedOn" => Some(Value::from(self.modified_on)),
            "attachedTo" => self
                .attached_to
                .map(|id| Value::String(id.to_string()))
                .or_else(|| self.attributes.get(key).cloned()),
            "attachedToClass" => self
                .attached_to_class
                .as_ref()
                .map(|c| Value::String(c.to_string()))
                .or_else(|| self.attributes.get(key).cloned()),
            "collection" => self
                .collection
                .clone()
                .map(Value::String)
                .or_else(|| self.attributes.get(key).cloned()),
            _ => self.attributes.get(key).cloned(),
        }
    }

    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    pub fn bool_attr(&self, name: &str) -> Option<bool> {
        self.attributes.get(name).and_then(Value::as_bool)
    }

    pub fn doc_id_attr(&self, name: &str) -> Option<DocId> {
        self.str_attr(name).and_then(|s| s.parse().ok())
    }

    pub fn doc_ids_attr(&self, name: &str) -> Vec<DocId> {
        doc_ids(self.attributes.get(name))
    }

    pub fn mixin(&self, mixin: &ClassId) -> Option<&Attributes> {
        self.mixins.get(mixin)
    }
}

/// Parse an array of id strings, skipping malformed entries.
pub fn doc_ids(value: Option<&Value>) -> Vec<DocId> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| s.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn push_all(target: &mut Attributes, push: &Attributes) {
    for (name, value) in push {
        push_value(target.entry(name.clone()).or_insert(Value::Null), value);
    }
}

fn push_value(target: &mut Value, value: &Value) {
    match target {
        Value::Array(items) => items.push(value.clone()),
        Value::Null => *target = Value::Array(vec![value.clone()]),
        other => *other = Value::Array(vec![other.take(), value.clone()]),
    }
}
