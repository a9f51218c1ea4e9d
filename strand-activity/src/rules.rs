//! Per-user notification preferences.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use strand_core::{class, ClassId, DocId, PersonAccount, SchemaDescriptor};

use crate::ids::{notification_type, provider, NotificationTypeId, ProviderId};

/// Providers mapped to the notification types they should deliver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyResult(BTreeMap<ProviderId, Vec<NotificationTypeId>>);

impl NotifyResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: ProviderId, kind: NotificationTypeId) {
        let kinds = self.0.entry(provider).or_default();
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }

    pub fn contains(&self, provider: &ProviderId) -> bool {
        self.0.contains_key(provider)
    }

    pub fn types(&self, provider: &ProviderId) -> Option<&[NotificationTypeId]> {
        self.0.get(provider).map(Vec::as_slice)
    }

    /// Hand every provider of `other` over to `other`'s types.
    pub fn take_over(&mut self, other: &NotifyResult) {
        for (provider, kinds) in &other.0 {
            self.0.insert(provider.clone(), kinds.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderId> {
        self.0.keys()
    }
}

#[async_trait]
pub trait NotificationRules: Send + Sync {
    /// Providers that deliver `kind` to `receiver`.
    async fn common(&self, receiver: &PersonAccount, kind: &NotificationTypeId) -> NotifyResult;

    /// Providers that deliver a message of `message_class` to a
    /// collaborator. They send the message notification in place of the
    /// mention.
    async fn message_level(&self, receiver: &PersonAccount, message_class: &ClassId) -> NotifyResult;
}

/// Serialized preference table.
///
/// ```toml
/// [defaults]
/// "activity:ids:MentionNotification" = ["notification:providers:InboxNotificationProvider"]
///
/// [message_types]
/// "activity:class:ActivityMessage" = "activity:ids:CollaboratorMessageNotification"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Providers enabled per type for every account.
    #[serde(default = "default_providers")]
    pub defaults: BTreeMap<NotificationTypeId, Vec<ProviderId>>,
    /// Type a message class is notified as; matched through the class hierarchy.
    #[serde(default = "default_message_types")]
    pub message_types: BTreeMap<ClassId, NotificationTypeId>,
    /// Per-account overrides, replacing the default provider list of a type.
    #[serde(default)]
    pub accounts: BTreeMap<DocId, BTreeMap<NotificationTypeId, Vec<ProviderId>>>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            defaults: default_providers(),
            message_types: default_message_types(),
            accounts: BTreeMap::new(),
        }
    }
}

fn default_providers() -> BTreeMap<NotificationTypeId, Vec<ProviderId>> {
    let mut defaults = BTreeMap::new();
    defaults.insert(notification_type::MENTION, vec![provider::INBOX, provider::EMAIL]);
    defaults.insert(notification_type::COLLABORATOR_MESSAGE, vec![provider::INBOX]);
    defaults
}

fn default_message_types() -> BTreeMap<ClassId, NotificationTypeId> {
    let mut types = BTreeMap::new();
    types.insert(class::ACTIVITY_MESSAGE, notification_type::COLLABORATOR_MESSAGE);
    types
}

/// [`NotificationRules`] backed by [`NotificationSettings`].
pub struct PreferenceRules {
    settings: NotificationSettings,
    schema: Arc<dyn SchemaDescriptor>,
}

impl PreferenceRules {
    pub fn new(settings: NotificationSettings, schema: Arc<dyn SchemaDescriptor>) -> Self {
        Self { settings, schema }
    }

    fn providers_for(&self, receiver: &PersonAccount, kind: &NotificationTypeId) -> NotifyResult {
        let enabled = self
            .settings
            .accounts
            .get(&receiver.id)
            .and_then(|overrides| overrides.get(kind))
            .or_else(|| self.settings.defaults.get(kind));

        let mut result = NotifyResult::new();
        for provider in enabled.into_iter().flatten() {
            result.insert(provider.clone(), kind.clone());
        }
        result
    }
}

#[async_trait]
impl NotificationRules for PreferenceRules {
    async fn common(&self, receiver: &PersonAccount, kind: &NotificationTypeId) -> NotifyResult {
        self.providers_for(receiver, kind)
    }

    async fn message_level(&self, receiver: &PersonAccount, message_class: &ClassId) -> NotifyResult {
        let mut result = NotifyResult::new();
        for (class, kind) in &self.settings.message_types {
            if self.schema.is_derived(message_class, class) {
                for provider in self.providers_for(receiver, kind).providers() {
                    result.insert(provider.clone(), kind.clone());
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::Hierarchy;

    fn account() -> PersonAccount {
        PersonAccount {
            id: DocId::new(),
            person: DocId::new(),
            email: "a@example.test".into(),
        }
    }

    #[test]
    fn test_message_level_takes_over_covered_providers() {
        let mut common = NotifyResult::new();
        common.insert(provider::INBOX, notification_type::MENTION);
        common.insert(provider::EMAIL, notification_type::MENTION);
        let mut covered = NotifyResult::new();
        covered.insert(provider::INBOX, notification_type::COLLABORATOR_MESSAGE);

        common.take_over(&covered);
        assert_eq!(
            common.types(&provider::INBOX),
            Some(&[notification_type::COLLABORATOR_MESSAGE][..])
        );
        assert_eq!(common.types(&provider::EMAIL), Some(&[notification_type::MENTION][..]));
    }

    #[tokio::test]
    async fn test_defaults_and_overrides() {
        let receiver = account();
        let mut settings = NotificationSettings::default();
        let rules = PreferenceRules::new(settings.clone(), Arc::new(Hierarchy::platform()));
        let common = rules.common(&receiver, &notification_type::MENTION).await;
        assert!(common.contains(&provider::INBOX));
        assert!(common.contains(&provider::EMAIL));

        let mut overrides = BTreeMap::new();
        overrides.insert(notification_type::MENTION, vec![provider::EMAIL]);
        settings.accounts.insert(receiver.id, overrides);
        let rules = PreferenceRules::new(settings, Arc::new(Hierarchy::platform()));
        let common = rules.common(&receiver, &notification_type::MENTION).await;
        assert!(!common.contains(&provider::INBOX));
        assert!(common.contains(&provider::EMAIL));
    }

    #[tokio::test]
    async fn test_message_level_follows_hierarchy() {
        let rules = PreferenceRules::new(NotificationSettings::default(), Arc::new(Hierarchy::platform()));
        let receiver = account();
        let level = rules.message_level(&receiver, &class::ACTIVITY_REFERENCE).await;
        assert!(level.contains(&provider::INBOX));
        assert!(!level.contains(&provider::EMAIL));

        let level = rules.message_level(&receiver, &class::SPACE).await;
        assert!(level.is_empty());
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let settings: NotificationSettings = serde_json::from_str(
            r#"{"defaults":{"activity:ids:MentionNotification":["notification:providers:InboxNotificationProvider"]}}"#,
        )
        .unwrap();
        assert_eq!(settings.defaults.len(), 1);
        assert_eq!(settings.message_types, default_message_types());
        assert!(settings.accounts.is_empty());
    }
}
