//! Class hierarchy, attribute types and index hints.
//!
//! Triggers and the index advisor only see the schema through
//! [`SchemaDescriptor`]. [`Hierarchy`] is the in-memory implementation; it
//! can be assembled in code or deserialized from a config file.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::ids::{class, mixin, ClassId, Domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    String,
    Number,
    Boolean,
    Ref,
    Array,
    Collection,
    /// Markup stored inline as JSON text.
    Markup,
    /// Rich text stored as a collaborative (yrs) document.
    CollaborativeMarkup,
    CollaborativeDoc,
}

impl TypeKind {
    pub fn is_markup(self) -> bool {
        matches!(self, TypeKind::Markup)
    }

    pub fn is_collaborative(self) -> bool {
        matches!(self, TypeKind::CollaborativeMarkup | TypeKind::CollaborativeDoc)
    }

    /// Content the reference extractor scans.
    pub fn carries_content(self) -> bool {
        self.is_markup() || self.is_collaborative()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    FullText,
    Indexed,
    IndexedDsc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub kind: TypeKind,
    #[serde(default)]
    pub index: Option<IndexKind>,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            index: None,
        }
    }

    pub fn indexed(mut self, index: IndexKind) -> Self {
        self.index = Some(index);
        self
    }
}

/// Sort direction of an index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum IndexOrder {
    Asc,
    Desc,
}

impl From<IndexOrder> for i32 {
    fn from(order: IndexOrder) -> i32 {
        match order {
            IndexOrder::Asc => 1,
            IndexOrder::Desc => -1,
        }
    }
}

impl TryFrom<i32> for IndexOrder {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(IndexOrder::Asc),
            -1 => Ok(IndexOrder::Desc),
            other => Err(format!("invalid index order {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    pub order: IndexOrder,
}

impl IndexKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: IndexOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: IndexOrder::Desc,
        }
    }
}

/// Secondary index over one or more fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub sparse: bool,
    /// Partial-index predicate; only its presence matters for naming.
    #[serde(default)]
    pub filter: Option<Value>,
}

impl FieldIndex {
    pub fn single(key: IndexKey) -> Self {
        Self {
            keys: vec![key],
            sparse: false,
            filter: None,
        }
    }
}

/// Index entry of a class-level or domain-level configuration. A plain
/// string is shorthand for a sparse ascending index on that field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexSpec {
    Field(String),
    Keys(FieldIndex),
}

impl IndexSpec {
    pub fn keys(&self) -> Vec<IndexKey> {
        match self {
            IndexSpec::Field(field) => vec![IndexKey::asc(field.clone())],
            IndexSpec::Keys(index) => index.keys.clone(),
        }
    }

    pub fn to_field_index(&self) -> FieldIndex {
        match self {
            IndexSpec::Field(field) => FieldIndex {
                keys: vec![IndexKey::asc(field.clone())],
                sparse: true,
                filter: None,
            },
            IndexSpec::Keys(index) => index.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassKind {
    #[default]
    Class,
    Mixin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub id: ClassId,
    #[serde(default)]
    pub kind: ClassKind,
    #[serde(default)]
    pub extends: Option<ClassId>,
    #[serde(default)]
    pub domain: Option<Domain>,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
    /// Class-level index configuration.
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    /// Documents of this class track their own collaborators.
    #[serde(default)]
    pub class_collaborators: bool,
}

impl ClassDef {
    pub fn new(id: ClassId) -> Self {
        Self {
            id,
            kind: ClassKind::Class,
            extends: None,
            domain: None,
            attributes: Vec::new(),
            indexes: Vec::new(),
            class_collaborators: false,
        }
    }

    pub fn mixin(id: ClassId, target: ClassId) -> Self {
        Self {
            kind: ClassKind::Mixin,
            extends: Some(target),
            ..Self::new(id)
        }
    }

    pub fn extends(mut self, parent: ClassId) -> Self {
        self.extends = Some(parent);
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(Domain::new(domain));
        self
    }

    pub fn attribute(mut self, attr: AttributeDef) -> Self {
        self.attributes.push(attr);
        self
    }

    pub fn index(mut self, spec: IndexSpec) -> Self {
        self.indexes.push(spec);
        self
    }

    pub fn with_class_collaborators(mut self) -> Self {
        self.class_collaborators = true;
        self
    }
}

/// Read-only schema access used by triggers and the index advisor.
pub trait SchemaDescriptor: Send + Sync {
    fn class(&self, id: &ClassId) -> Option<&ClassDef>;

    fn classes(&self) -> Vec<&ClassDef>;

    /// Own and inherited attributes, nearest class first.
    fn all_attributes(&self, id: &ClassId) -> Vec<AttributeDef>;

    /// Whether `id` is `base` or one of its descendants.
    fn is_derived(&self, id: &ClassId, base: &ClassId) -> bool;

    /// Storage domain, inherited from the closest ancestor that declares one.
    fn domain_of(&self, id: &ClassId) -> Option<Domain>;

    fn index_configuration(&self, id: &ClassId) -> Vec<IndexSpec>;

    fn has_class_collaborators(&self, id: &ClassId) -> bool;

    /// Attributes that hold markup or collaborative content.
    fn content_attributes(&self, id: &ClassId) -> Vec<AttributeDef> {
        self.all_attributes(id)
            .into_iter()
            .filter(|a| a.kind.carries_content())
            .collect()
    }
}

/// In-memory class hierarchy.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    classes: HashMap<ClassId, ClassDef>,
}

/// Serialized form of a schema (`[[classes]]` tables).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub classes: Vec<ClassDef>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in classes every workspace has.
    pub fn platform() -> Self {
        let mut h = Self::new();
        h.add(ClassDef::new(class::DOC).domain("model"));
        h.add(ClassDef::new(class::ATTACHED_DOC).extends(class::DOC));
        h.add(
            ClassDef::new(class::SPACE)
                .extends(class::DOC)
                .domain("space")
                .attribute(AttributeDef::new("name", TypeKind::String).indexed(IndexKind::FullText))
                .attribute(AttributeDef::new("private", TypeKind::Boolean))
                .attribute(AttributeDef::new("members", TypeKind::Array)),
        );
        h.add(
            ClassDef::new(class::PERSON)
                .extends(class::DOC)
                .domain("contact")
                .attribute(AttributeDef::new("name", TypeKind::String).indexed(IndexKind::FullText)),
        );
        h.add(
            ClassDef::new(class::PERSON_ACCOUNT)
                .extends(class::DOC)
                .domain("contact")
                .attribute(AttributeDef::new("person", TypeKind::Ref).indexed(IndexKind::Indexed))
                .attribute(AttributeDef::new("email", TypeKind::String)),
        );
        h.add(ClassDef::mixin(mixin::EMPLOYEE, class::PERSON)
            .attribute(AttributeDef::new("active", TypeKind::Boolean)));
        h.add(ClassDef::mixin(mixin::COLLABORATORS, class::DOC)
            .attribute(AttributeDef::new("collaborators", TypeKind::Array)));
        h.add(
            ClassDef::new(class::ACTIVITY_MESSAGE)
                .extends(class::ATTACHED_DOC)
                .domain("activity")
                .attribute(AttributeDef::new("attachedTo", TypeKind::Ref).indexed(IndexKind::Indexed)),
        );
        h.add(
            ClassDef::new(class::ACTIVITY_REFERENCE)
                .extends(class::ACTIVITY_MESSAGE)
                .attribute(AttributeDef::new("srcDocId", TypeKind::Ref).indexed(IndexKind::Indexed))
                .attribute(AttributeDef::new("srcDocClass", TypeKind::Ref))
                .attribute(AttributeDef::new("attachedDocId", TypeKind::Ref).indexed(IndexKind::Indexed))
                .attribute(AttributeDef::new("message", TypeKind::String)),
        );
        h.add(
            ClassDef::new(class::USER_MENTION_INFO)
                .extends(class::ATTACHED_DOC)
                .domain("activity")
                .attribute(AttributeDef::new("user", TypeKind::Ref).indexed(IndexKind::Indexed))
                .attribute(AttributeDef::new("content", TypeKind::String)),
        );
        h.add(
            ClassDef::new(class::DOC_NOTIFY_CONTEXT)
                .extends(class::DOC)
                .domain("notification")
                .attribute(AttributeDef::new("user", TypeKind::Ref).indexed(IndexKind::Indexed))
                .attribute(AttributeDef::new("attachedTo", TypeKind::Ref).indexed(IndexKind::Indexed)),
        );
        h.add(
            ClassDef::new(class::INBOX_NOTIFICATION)
                .extends(class::DOC)
                .domain("notification")
                .attribute(AttributeDef::new("user", TypeKind::Ref).indexed(IndexKind::Indexed))
                .attribute(AttributeDef::new("isViewed", TypeKind::Boolean).indexed(IndexKind::Indexed))
                .attribute(AttributeDef::new("docNotifyContext", TypeKind::Ref).indexed(IndexKind::Indexed)),
        );
        h.add(ClassDef::new(class::MENTION_INBOX_NOTIFICATION).extends(class::INBOX_NOTIFICATION));
        h
    }

    /// Platform classes plus the ones declared in `file`.
    pub fn from_schema_file(file: SchemaFile) -> Self {
        let mut h = Self::platform();
        for def in file.classes {
            h.add(def);
        }
        h
    }

    pub fn add(&mut self, def: ClassDef) {
        self.classes.insert(def.id.clone(), def);
    }

    /// Ancestor chain starting at `id`. Stops on unknown classes and cycles.
    fn ancestors(&self, id: &ClassId) -> Vec<&ClassDef> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.classes.get(id);
        while let Some(def) = current {
            if !seen.insert(&def.id) {
                break;
            }
            chain.push(def);
            current = def.extends.as_ref().and_then(|p| self.classes.get(p));
        }
        chain
    }
}

impl SchemaDescriptor for Hierarchy {
    fn class(&self, id: &ClassId) -> Option<&ClassDef> {
        self.classes.get(id)
    }

    fn classes(&self) -> Vec<&ClassDef> {
        let mut all: Vec<&ClassDef> = self.classes.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn all_attributes(&self, id: &ClassId) -> Vec<AttributeDef> {
        let mut seen = HashSet::new();
        let mut attrs = Vec::new();
        for def in self.ancestors(id) {
            for attr in &def.attributes {
                if seen.insert(attr.name.clone()) {
                    attrs.push(attr.clone());
                }
            }
        }
        attrs
    }

    fn is_derived(&self, id: &ClassId, base: &ClassId) -> bool {
        if id == base {
            return true;
        }
        self.ancestors(id).iter().any(|def| &def.id == base)
    }

    fn domain_of(&self, id: &ClassId) -> Option<Domain> {
        self.ancestors(id)
            .into_iter()
            .filter(|def| def.kind == ClassKind::Class)
            .find_map(|def| def.domain.clone())
    }

    fn index_configuration(&self, id: &ClassId) -> Vec<IndexSpec> {
        self.classes
            .get(id)
            .map(|def| def.indexes.clone())
            .unwrap_or_default()
    }

    fn has_class_collaborators(&self, id: &ClassId) -> bool {
        self.ancestors(id).iter().any(|def| def.class_collaborators)
    }
}
