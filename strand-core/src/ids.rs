//! Identifiers shared by every layer of the platform.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a stored document (also used for accounts and spaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(pub Uuid);

impl DocId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(DocId)
    }
}

impl From<Uuid> for DocId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Class or mixin identifier, e.g. `contact:class:Person`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(Cow<'static, str>);

impl ClassId {
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Logical storage collection that a class family persists into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(pub String);

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tenant identifier. Every workspace owns an isolated store and log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Well-known classes the triggers depend on.
pub mod class {
    use super::ClassId;

    pub const DOC: ClassId = ClassId::from_static("core:class:Doc");
    pub const ATTACHED_DOC: ClassId = ClassId::from_static("core:class:AttachedDoc");
    pub const SPACE: ClassId = ClassId::from_static("core:class:Space");

    pub const PERSON: ClassId = ClassId::from_static("contact:class:Person");
    pub const PERSON_ACCOUNT: ClassId = ClassId::from_static("contact:class:PersonAccount");

    pub const ACTIVITY_MESSAGE: ClassId = ClassId::from_static("activity:class:ActivityMessage");
    pub const ACTIVITY_REFERENCE: ClassId = ClassId::from_static("activity:class:ActivityReference");
    pub const USER_MENTION_INFO: ClassId = ClassId::from_static("activity:class:UserMentionInfo");

    pub const INBOX_NOTIFICATION: ClassId =
        ClassId::from_static("notification:class:InboxNotification");
    pub const MENTION_INBOX_NOTIFICATION: ClassId =
        ClassId::from_static("notification:class:MentionInboxNotification");
    pub const DOC_NOTIFY_CONTEXT: ClassId =
        ClassId::from_static("notification:class:DocNotifyContext");
}

/// Well-known mixins (capabilities attached to existing documents).
pub mod mixin {
    use super::ClassId;

    pub const COLLABORATORS: ClassId = ClassId::from_static("notification:mixin:Collaborators");
    pub const EMPLOYEE: ClassId = ClassId::from_static("contact:mixin:Employee");
}
