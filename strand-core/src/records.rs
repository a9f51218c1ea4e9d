//! Typed views over the generic [`Doc`] for the classes the triggers read
//! and write.

use serde_json::{json, Value};

use crate::ids::{class, mixin, ClassId, DocId};
use crate::tx::{doc_ids, Attributes, Doc};

/// Collection name of references attached to their target.
pub const REFERENCES_COLLECTION: &str = "references";
/// Collection name of mention markers attached to the mentioning document.
pub const MENTIONS_COLLECTION: &str = "mentions";

/// A stored pointer from a source document to a target it mentions.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub id: DocId,
    pub space: DocId,
    pub src_doc_id: DocId,
    pub src_doc_class: ClassId,
    pub attached_doc_id: Option<DocId>,
    pub attached_doc_class: Option<ClassId>,
    /// Target of the mention.
    pub attached_to: DocId,
    pub attached_to_class: ClassId,
    /// Markup excerpt around the mention.
    pub message: String,
}

impl Reference {
    pub fn from_doc(doc: &Doc) -> Option<Self> {
        Some(Self {
            id: doc.id,
            space: doc.space,
            src_doc_id: doc.doc_id_attr("srcDocId")?,
            src_doc_class: ClassId::new(doc.str_attr("srcDocClass")?),
            attached_doc_id: doc.doc_id_attr("attachedDocId"),
            attached_doc_class: doc.str_attr("attachedDocClass").map(ClassId::new),
            attached_to: doc.attached_to?,
            attached_to_class: doc.attached_to_class.clone()?,
            message: doc.str_attr("message").unwrap_or_default().to_string(),
        })
    }

    /// Attributes of the stored reference document.
    pub fn to_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("srcDocId".into(), json!(self.src_doc_id));
        attrs.insert("srcDocClass".into(), json!(self.src_doc_class));
        if let Some(id) = self.attached_doc_id {
            attrs.insert("attachedDocId".into(), json!(id));
        }
        if let Some(class) = &self.attached_doc_class {
            attrs.insert("attachedDocClass".into(), json!(class));
        }
        attrs.insert("message".into(), json!(self.message));
        attrs
    }

    /// Document a mention marker for this reference is attached to.
    pub fn mention_anchor(&self) -> DocId {
        self.attached_doc_id.unwrap_or(self.src_doc_id)
    }

    pub fn mention_anchor_class(&self) -> ClassId {
        self.attached_doc_class
            .clone()
            .unwrap_or_else(|| self.src_doc_class.clone())
    }

    /// Same source and same target (the excerpt may differ).
    pub fn same_link(&self, other: &Reference) -> bool {
        self.src_doc_id == other.src_doc_id
            && self.src_doc_class == other.src_doc_class
            && self.attached_to == other.attached_to
    }
}

/// Per-user record of a mention, used to suppress duplicate notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct MentionMarker {
    pub id: DocId,
    pub space: DocId,
    /// Mentioned person.
    pub user: DocId,
    pub attached_to: DocId,
    pub attached_to_class: ClassId,
    pub content: String,
}

impl MentionMarker {
    pub fn from_doc(doc: &Doc) -> Option<Self> {
        Some(Self {
            id: doc.id,
            space: doc.space,
            user: doc.doc_id_attr("user")?,
            attached_to: doc.attached_to?,
            attached_to_class: doc.attached_to_class.clone()?,
            content: doc.str_attr("content").unwrap_or_default().to_string(),
        })
    }

    pub fn attributes(user: DocId, content: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("user".into(), json!(user));
        attrs.insert("content".into(), json!(content));
        attrs
    }
}

/// Login account bound to a person.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonAccount {
    pub id: DocId,
    pub person: DocId,
    pub email: String,
}

impl PersonAccount {
    pub fn from_doc(doc: &Doc) -> Option<Self> {
        Some(Self {
            id: doc.id,
            person: doc.doc_id_attr("person")?,
            email: doc.str_attr("email").unwrap_or_default().to_string(),
        })
    }
}

/// Membership container.
#[derive(Debug, Clone, PartialEq)]
pub struct Space {
    pub id: DocId,
    pub class: ClassId,
    pub private: bool,
    pub members: Vec<DocId>,
}

impl Space {
    pub fn from_doc(doc: &Doc) -> Self {
        Self {
            id: doc.id,
            class: doc.class.clone(),
            private: doc.bool_attr("private").unwrap_or(false),
            members: doc.doc_ids_attr("members"),
        }
    }

    pub fn is_member(&self, account: DocId) -> bool {
        self.members.contains(&account)
    }
}

/// Per-user notification thread for a document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocNotifyContext {
    pub id: DocId,
    pub space: DocId,
    pub attached_to: DocId,
    pub attached_to_class: ClassId,
    pub user: DocId,
}

impl DocNotifyContext {
    pub fn from_doc(doc: &Doc) -> Option<Self> {
        Some(Self {
            id: doc.id,
            space: doc.space,
            attached_to: doc.doc_id_attr("attachedTo")?,
            attached_to_class: ClassId::new(doc.str_attr("attachedToClass")?),
            user: doc.doc_id_attr("user")?,
        })
    }

    pub fn to_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("attachedTo".into(), json!(self.attached_to));
        attrs.insert("attachedToClass".into(), json!(self.attached_to_class));
        attrs.insert("user".into(), json!(self.user));
        attrs
    }

    pub fn class() -> ClassId {
        class::DOC_NOTIFY_CONTEXT
    }
}

/// Accounts subscribed to a document (stored as a mixin).
pub fn collaborators(doc: &Doc) -> Vec<DocId> {
    doc_ids(doc.mixin(&mixin::COLLABORATORS).and_then(|m| m.get("collaborators")))
}

/// Mixin attributes that set the collaborator list to `accounts`.
pub fn collaborators_attributes(accounts: &[DocId]) -> Attributes {
    let mut attrs = Attributes::new();
    let ids: Vec<Value> = accounts.iter().map(|id| json!(id)).collect();
    attrs.insert("collaborators".into(), Value::Array(ids));
    attrs
}

/// Whether the person document carries an active employee capability.
pub fn is_active_employee(person: &Doc) -> bool {
    person
        .mixin(&mixin::EMPLOYEE)
        .and_then(|m| m.get("active"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
