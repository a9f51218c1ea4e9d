//! Identifiers of notification channels and notification types.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// A notification channel (inbox, email, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(Cow<'static, str>);

impl ProviderId {
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

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A kind of notification a user can enable per provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationTypeId(Cow<'static, str>);

impl NotificationTypeId {
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

impl fmt::Display for NotificationTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub mod provider {
    use super::ProviderId;

    pub const INBOX: ProviderId = ProviderId::from_static("notification:providers:InboxNotificationProvider");
    pub const EMAIL: ProviderId = ProviderId::from_static("notification:providers:EmailNotificationProvider");
}

pub mod notification_type {
    use super::NotificationTypeId;

    /// Someone mentioned you anywhere.
    pub const MENTION: NotificationTypeId =
        NotificationTypeId::from_static("activity:ids:MentionNotification");
    /// A new message in a thread you collaborate on.
    pub const COLLABORATOR_MESSAGE: NotificationTypeId =
        NotificationTypeId::from_static("activity:ids:CollaboratorMessageNotification");
}
