//! Mention notifications for person targets.
//!
//! For each new reference to a person the dispatcher:
//!
//! 1. resolves the person's account and skips self-mentions,
//! 2. checks space access, joining public spaces,
//! 3. subscribes the receiver as a collaborator of the source (and of the
//!    mentioning message),
//! 4. records or refreshes the per-user mention marker,
//! 5. asks the rules which providers deliver the mention, minus those that
//!    already deliver the message itself,
//! 6. finds or creates the notification context and invokes providers.
//!
//! Everything is returned as transactions for the caller to commit.

use serde_json::json;
use std::sync::Arc;

use strand_core::records::collaborators;
use strand_core::{
    class, excerpt_equal, mixin, ClassId, Doc, DocId, DocNotifyContext, MentionMarker,
    PersonAccount, Query, Reference, SchemaDescriptor, Space, TriggerStore, Tx, TxFactory, TxKind,
    MENTIONS_COLLECTION,
};

use crate::error::ActivityResult;
use crate::ids::{notification_type, provider};
use crate::providers::{NotificationProvider, NotificationRequest};
use crate::rules::{NotificationRules, NotifyResult};

pub struct MentionDispatcher {
    schema: Arc<dyn SchemaDescriptor>,
    store: Arc<dyn TriggerStore>,
    rules: Arc<dyn NotificationRules>,
    providers: Vec<Arc<dyn NotificationProvider>>,
}

impl MentionDispatcher {
    pub fn new(
        schema: Arc<dyn SchemaDescriptor>,
        store: Arc<dyn TriggerStore>,
        rules: Arc<dyn NotificationRules>,
        providers: Vec<Arc<dyn NotificationProvider>>,
    ) -> Self {
        Self {
            schema,
            store,
            rules,
            providers,
        }
    }

    /// Transactions notifying the person `reference` points at. `sender` is
    /// the account that wrote the mention, `origin` the transaction that
    /// introduced it.
    pub async fn person_notification_txes(
        &self,
        factory: &TxFactory,
        reference: &Reference,
        sender: DocId,
        origin: &Tx,
    ) -> ActivityResult<Vec<Tx>> {
        let Some(receiver) = self.receiver_account(reference.attached_to).await? else {
            log::debug!("Person {} has no account, not notifying", reference.attached_to);
            return Ok(Vec::new());
        };
        if receiver.id == sender {
            return Ok(Vec::new());
        }

        let mut txes = Vec::new();
        if !self.check_space(factory, reference.space, &receiver, &mut txes).await? {
            log::debug!("Account {} cannot see space {}", receiver.id, reference.space);
            return Ok(Vec::new());
        }

        let source = self.store.get(reference.src_doc_id).await?;
        if let Some(source) = &source {
            txes.extend(self.collaborator_tx(factory, source, receiver.id));
        }
        if let (Some(id), Some(attached_class)) = (reference.attached_doc_id, &reference.attached_doc_class) {
            if id != reference.src_doc_id && self.schema.is_derived(attached_class, &class::ACTIVITY_MESSAGE) {
                if let Some(message) = self.store.get(id).await? {
                    txes.extend(self.collaborator_tx(factory, &message, receiver.id));
                }
            }
        }
        let Some(source) = source else {
            return Ok(txes);
        };

        txes.extend(self.marker_tx(factory, reference, &receiver).await?);

        let mut enabled = self.rules.common(&receiver, &notification_type::MENTION).await;
        let covered = self.message_level(reference, &receiver, &source, origin).await;
        enabled.take_over(&covered);
        if enabled.is_empty() {
            return Ok(txes);
        }

        let existing = self.find_context(source.id, receiver.id).await?;
        let context = match existing {
            Some(context) => context,
            None if enabled.contains(&provider::INBOX) => {
                let context = DocNotifyContext {
                    id: DocId::new(),
                    space: source.space,
                    attached_to: source.id,
                    attached_to_class: source.class.clone(),
                    user: receiver.id,
                };
                txes.push(factory.create_doc(
                    DocNotifyContext::class(),
                    context.space,
                    context.id,
                    context.to_attributes(),
                ));
                context
            }
            None => {
                log::debug!("No notification context for {} on {}", receiver.id, source.id);
                return Ok(txes);
            }
        };

        let request = NotificationRequest {
            types: Vec::new(),
            reference: reference.clone(),
            context,
            receiver,
            sender,
            source,
        };
        txes.extend(self.invoke_providers(factory, &enabled, request).await);
        Ok(txes)
    }

    async fn receiver_account(&self, person: DocId) -> ActivityResult<Option<PersonAccount>> {
        let doc = self
            .store
            .find_one(&class::PERSON_ACCOUNT, &Query::new().eq("person", person))
            .await?;
        Ok(doc.as_ref().and_then(PersonAccount::from_doc))
    }

    /// Whether the receiver may see `space_id`. A non-member of a public
    /// space is added to its members.
    async fn check_space(
        &self,
        factory: &TxFactory,
        space_id: DocId,
        receiver: &PersonAccount,
        txes: &mut Vec<Tx>,
    ) -> ActivityResult<bool> {
        let Some(doc) = self.store.get(space_id).await? else {
            return Ok(true);
        };
        if !self.schema.is_derived(&doc.class, &class::SPACE) {
            return Ok(true);
        }
        let space = Space::from_doc(&doc);
        if space.is_member(receiver.id) {
            return Ok(true);
        }
        if space.private {
            return Ok(false);
        }
        txes.push(factory.push(space.class, doc.space, space.id, "members", json!(receiver.id)));
        Ok(true)
    }

    fn collaborator_tx(&self, factory: &TxFactory, doc: &Doc, account: DocId) -> Option<Tx> {
        if collaborators(doc).contains(&account) {
            return None;
        }
        Some(factory.mixin_push(
            doc.id,
            doc.class.clone(),
            doc.space,
            mixin::COLLABORATORS,
            "collaborators",
            json!(account),
        ))
    }

    /// Create the receiver's marker on the mention anchor, or refresh its
    /// content when the excerpt changed.
    async fn marker_tx(
        &self,
        factory: &TxFactory,
        reference: &Reference,
        receiver: &PersonAccount,
    ) -> ActivityResult<Option<Tx>> {
        let anchor = reference.mention_anchor();
        let anchor_class = reference.mention_anchor_class();
        let query = Query::new()
            .eq("user", receiver.person)
            .eq("attachedTo", anchor);
        let existing = self
            .store
            .find_one(&class::USER_MENTION_INFO, &query)
            .await?
            .as_ref()
            .and_then(MentionMarker::from_doc);

        let inner = match existing {
            Some(marker) if excerpt_equal(&marker.content, &reference.message) => return Ok(None),
            Some(marker) => {
                let mut ops = strand_core::Attributes::new();
                ops.insert("content".into(), json!(reference.message));
                factory.update_doc(class::USER_MENTION_INFO, marker.space, marker.id, ops)
            }
            None => factory.create_doc(
                class::USER_MENTION_INFO,
                reference.space,
                DocId::new(),
                MentionMarker::attributes(receiver.person, &reference.message),
            ),
        };
        Ok(Some(factory.collection(
            anchor,
            anchor_class,
            reference.space,
            MENTIONS_COLLECTION,
            inner,
        )))
    }

    /// Providers already notifying the receiver about the mentioning message
    /// itself: only for freshly created messages on a source the receiver
    /// already collaborates on.
    async fn message_level(
        &self,
        reference: &Reference,
        receiver: &PersonAccount,
        source: &Doc,
        origin: &Tx,
    ) -> NotifyResult {
        let Some(message_class) = &reference.attached_doc_class else {
            return NotifyResult::new();
        };
        let fresh_message = origin.extract().kind() == TxKind::Create
            && self.schema.is_derived(message_class, &class::ACTIVITY_MESSAGE);
        if !fresh_message || !collaborators(source).contains(&receiver.id) {
            return NotifyResult::new();
        }
        self.rules.message_level(receiver, message_class).await
    }

    async fn find_context(&self, source: DocId, user: DocId) -> ActivityResult<Option<DocNotifyContext>> {
        let query = Query::new().eq("attachedTo", source).eq("user", user);
        let doc = self
            .store
            .find_one(&class::DOC_NOTIFY_CONTEXT, &query)
            .await?;
        Ok(doc.as_ref().and_then(DocNotifyContext::from_doc))
    }

    /// Run every enabled provider. A failing provider is logged and skipped.
    async fn invoke_providers(
        &self,
        factory: &TxFactory,
        enabled: &NotifyResult,
        mut request: NotificationRequest,
    ) -> Vec<Tx> {
        let mut txes = Vec::new();
        for provider in &self.providers {
            let id = provider.id();
            let Some(types) = enabled.types(&id) else {
                continue;
            };
            request.types = types.to_vec();
            match provider.notify(factory, &request).await {
                Ok(derived) => txes.extend(derived),
                Err(e) => log::error!("Notification provider {id} failed: {e}"),
            }
        }
        txes
    }
}

/// Mentions of persons go through the dispatcher instead of becoming
/// plain references.
pub fn is_person_target(schema: &dyn SchemaDescriptor, target_class: &ClassId) -> bool {
    schema.is_derived(target_class, &class::PERSON)
}
