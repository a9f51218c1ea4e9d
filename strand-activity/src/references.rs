//! Reference extraction and reconciliation.
//!
//! Whenever a document with markup or collaborative content is created,
//! updated or removed, the trigger rescans its content and brings the
//! stored references (and per-user mention markers) in line with what
//! the content mentions now.
//!
//! ```text
//! Tx ─► content attributes ─► extract ─► desired ─┐
//!                                                 ├─► reconcile ─► update/remove txes
//!        stored references + markers ─► current ──┘        │
//!                                                          └─► to_create ─► person? ─► MentionDispatcher
//!                                                                              └─────► create Reference
//! ```

use serde_json::json;
use std::sync::Arc;

use strand_core::{
    class, excerpt_equal, references_in, Attributes, ClassId, CollaborativeRef,
    CollaborativeStore, Content, Doc, DocId, MentionMarker, Query, Reference, SchemaDescriptor,
    TriggerStore, Tx, TxBody, TxFactory, TxKind, MENTIONS_COLLECTION, REFERENCES_COLLECTION,
};

use crate::error::ActivityResult;
use crate::notify::{is_person_target, MentionDispatcher};

/// Outcome of comparing wanted references with stored ones.
#[derive(Debug, Default)]
pub struct ReferenceDiff {
    /// Updates and removals of stored references and markers.
    pub txes: Vec<Tx>,
    /// Wanted references with no stored counterpart.
    pub to_create: Vec<Reference>,
}

/// Compare `desired` against the stored `current` references and the
/// mention `markers` of the scanned document.
///
/// A stored reference still wanted is kept (its excerpt refreshed when it
/// changed); one no longer wanted is removed. A marker whose user is still
/// mentioned with the same excerpt consumes that mention, so no new
/// notification goes out; a marker whose user is no longer mentioned is
/// removed.
pub fn reconcile(
    factory: &TxFactory,
    mut desired: Vec<Reference>,
    current: &[Reference],
    markers: &[MentionMarker],
) -> ReferenceDiff {
    let mut txes = Vec::new();

    for stored in current {
        match desired.iter().position(|wanted| wanted.same_link(stored)) {
            Some(idx) => {
                let wanted = desired.remove(idx);
                if !excerpt_equal(&wanted.message, &stored.message) {
                    let mut ops = Attributes::new();
                    ops.insert("message".into(), json!(wanted.message));
                    txes.push(factory.collection(
                        stored.attached_to,
                        stored.attached_to_class.clone(),
                        stored.space,
                        REFERENCES_COLLECTION,
                        factory.update_doc(class::ACTIVITY_REFERENCE, stored.space, stored.id, ops),
                    ));
                }
            }
            None => txes.push(remove_reference(factory, stored)),
        }
    }

    for marker in markers {
        let mentioned = desired
            .iter()
            .position(|wanted| wanted.attached_to == marker.user && wanted.mention_anchor() == marker.attached_to);
        match mentioned {
            Some(idx) => {
                if excerpt_equal(&desired[idx].message, &marker.content) {
                    desired.remove(idx);
                }
            }
            None => txes.push(remove_marker(factory, marker)),
        }
    }

    ReferenceDiff {
        txes,
        to_create: desired,
    }
}

fn remove_reference(factory: &TxFactory, reference: &Reference) -> Tx {
    factory.collection(
        reference.attached_to,
        reference.attached_to_class.clone(),
        reference.space,
        REFERENCES_COLLECTION,
        factory.remove_doc(class::ACTIVITY_REFERENCE, reference.space, reference.id),
    )
}

fn remove_marker(factory: &TxFactory, marker: &MentionMarker) -> Tx {
    factory.collection(
        marker.attached_to,
        marker.attached_to_class.clone(),
        marker.space,
        MENTIONS_COLLECTION,
        factory.remove_doc(class::USER_MENTION_INFO, marker.space, marker.id),
    )
}

fn create_reference(factory: &TxFactory, reference: &Reference) -> Tx {
    factory.collection(
        reference.attached_to,
        reference.attached_to_class.clone(),
        reference.space,
        REFERENCES_COLLECTION,
        factory.create_doc(
            class::ACTIVITY_REFERENCE,
            reference.space,
            reference.id,
            reference.to_attributes(),
        ),
    )
}

/// Keeps references and mention markers in step with document content.
pub struct ReferenceTrigger {
    schema: Arc<dyn SchemaDescriptor>,
    store: Arc<dyn TriggerStore>,
    collaborative: Arc<dyn CollaborativeStore>,
    dispatcher: MentionDispatcher,
}

impl ReferenceTrigger {
    pub fn new(
        schema: Arc<dyn SchemaDescriptor>,
        store: Arc<dyn TriggerStore>,
        collaborative: Arc<dyn CollaborativeStore>,
        dispatcher: MentionDispatcher,
    ) -> Self {
        Self {
            schema,
            store,
            collaborative,
            dispatcher,
        }
    }

    /// Derived transactions for one committed transaction.
    pub async fn on_tx(&self, tx: &Tx) -> ActivityResult<Vec<Tx>> {
        let inner = tx.extract();
        if self.is_ignored(&inner.object_class) {
            return Ok(Vec::new());
        }
        match inner.kind() {
            TxKind::Create => self.on_create(tx).await,
            TxKind::Update => self.on_update(tx).await,
            TxKind::Remove => self.on_remove(tx).await,
            _ => Ok(Vec::new()),
        }
    }

    /// Documents the trigger itself writes never carry references.
    fn is_ignored(&self, object_class: &ClassId) -> bool {
        [
            class::ACTIVITY_REFERENCE,
            class::USER_MENTION_INFO,
            class::INBOX_NOTIFICATION,
            class::DOC_NOTIFY_CONTEXT,
        ]
        .iter()
        .any(|base| self.schema.is_derived(object_class, base))
    }

    async fn on_create(&self, tx: &Tx) -> ActivityResult<Vec<Tx>> {
        let Some(doc) = Doc::from_create(tx) else {
            return Ok(Vec::new());
        };
        if self.schema.content_attributes(&doc.class).is_empty() {
            return Ok(Vec::new());
        }
        let desired = self.desired_references(&doc).await;
        if desired.is_empty() {
            return Ok(Vec::new());
        }

        let factory = TxFactory::new(tx.modified_by);
        let diff = reconcile(&factory, desired, &[], &[]);
        let mut txes = diff.txes;
        txes.extend(self.create_txes(&factory, diff.to_create, tx).await?);
        Ok(txes)
    }

    async fn on_update(&self, tx: &Tx) -> ActivityResult<Vec<Tx>> {
        let inner = tx.extract();
        let content = self.schema.content_attributes(&inner.object_class);
        let touched = tx.touched_attributes();
        if !content.iter().any(|attr| touched.contains(&attr.name.as_str())) {
            return Ok(Vec::new());
        }

        let Some(mut doc) = self.store.get(inner.object_id).await? else {
            log::debug!("Updated document {} is gone, skipping references", inner.object_id);
            return Ok(Vec::new());
        };
        // Idempotent when the store already reflects the update.
        if let TxBody::Update { operations, .. } = &inner.body {
            doc.set_attributes(operations);
        }

        let (src_id, src_class) = self.reference_source(&doc);
        let current_query = Query::new()
            .eq("srcDocId", src_id)
            .eq("srcDocClass", &src_class)
            .eq("attachedDocId", doc.id);
        let current: Vec<Reference> = self
            .store
            .find(&class::ACTIVITY_REFERENCE, &current_query)
            .await?
            .iter()
            .filter_map(Reference::from_doc)
            .collect();
        let markers: Vec<MentionMarker> = self
            .store
            .find(&class::USER_MENTION_INFO, &Query::new().eq("attachedTo", doc.id))
            .await?
            .iter()
            .filter_map(MentionMarker::from_doc)
            .collect();

        let desired = self.desired_references(&doc).await;
        let factory = TxFactory::new(tx.modified_by);
        let diff = reconcile(&factory, desired, &current, &markers);
        let mut txes = diff.txes;
        txes.extend(self.create_txes(&factory, diff.to_create, tx).await?);
        Ok(txes)
    }

    async fn on_remove(&self, tx: &Tx) -> ActivityResult<Vec<Tx>> {
        let inner = tx.extract();
        if self.schema.content_attributes(&inner.object_class).is_empty() {
            return Ok(Vec::new());
        }
        let factory = TxFactory::new(tx.modified_by);
        let mut txes = Vec::new();

        let references = self
            .store
            .find(&class::ACTIVITY_REFERENCE, &Query::new().eq("attachedDocId", inner.object_id))
            .await?;
        for reference in references.iter().filter_map(Reference::from_doc) {
            txes.push(remove_reference(&factory, &reference));
        }

        let markers = self
            .store
            .find(&class::USER_MENTION_INFO, &Query::new().eq("attachedTo", inner.object_id))
            .await?;
        for marker in markers.iter().filter_map(MentionMarker::from_doc) {
            txes.push(remove_marker(&factory, &marker));
        }

        if !txes.is_empty() {
            log::debug!("Removing {} references of {}", txes.len(), inner.object_id);
        }
        Ok(txes)
    }

    /// The document a reference found in `doc` is reported against.
    ///
    /// Messages attached to a parent report against the parent. Other
    /// attached documents report against the parent too, unless their class
    /// keeps its own collaborators.
    fn reference_source(&self, doc: &Doc) -> (DocId, ClassId) {
        match (doc.attached_to, &doc.attached_to_class) {
            (Some(parent), Some(parent_class))
                if self.schema.is_derived(&doc.class, &class::ACTIVITY_MESSAGE)
                    || !self.schema.has_class_collaborators(&doc.class) =>
            {
                (parent, parent_class.clone())
            }
            _ => (doc.id, doc.class.clone()),
        }
    }

    /// Every reference the current content of `doc` implies, one per target.
    async fn desired_references(&self, doc: &Doc) -> Vec<Reference> {
        let (src_id, src_class) = self.reference_source(doc);
        let space = if self.schema.is_derived(&src_class, &class::SPACE) {
            src_id
        } else {
            doc.space
        };

        let mut out: Vec<Reference> = Vec::new();
        for attr in self.schema.content_attributes(&doc.class) {
            let found = if attr.kind.is_markup() {
                match doc.str_attr(&attr.name) {
                    Some(text) => references_in(Content::Markup(text)),
                    None => continue,
                }
            } else {
                let key = CollaborativeRef::new(doc.id, attr.name.as_str());
                match self.collaborative.load(&key).await {
                    Ok(Some(buffer)) => references_in(Content::Collaborative {
                        buffer: &buffer,
                        field: &attr.name,
                    }),
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("Cannot load collaborative content {}: {e}", key.key());
                        continue;
                    }
                }
            };

            for found in found {
                if found.object_id == doc.id || found.object_id == src_id {
                    continue;
                }
                if out.iter().any(|r| r.attached_to == found.object_id) {
                    continue;
                }
                out.push(Reference {
                    id: DocId::new(),
                    space,
                    src_doc_id: src_id,
                    src_doc_class: src_class.clone(),
                    attached_doc_id: Some(doc.id),
                    attached_doc_class: Some(doc.class.clone()),
                    attached_to: found.object_id,
                    attached_to_class: found.object_class,
                    message: found.parent_excerpt,
                });
            }
        }
        out
    }

    async fn create_txes(&self, factory: &TxFactory, references: Vec<Reference>, origin: &Tx) -> ActivityResult<Vec<Tx>> {
        let mut txes = Vec::new();
        for reference in references {
            if is_person_target(self.schema.as_ref(), &reference.attached_to_class) {
                txes.extend(
                    self.dispatcher
                        .person_notification_txes(factory, &reference, origin.modified_by, origin)
                        .await?,
                );
            } else {
                txes.push(create_reference(factory, &reference));
            }
        }
        Ok(txes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(target: DocId, message: &str) -> Reference {
        Reference {
            id: DocId::new(),
            space: DocId::nil(),
            src_doc_id: DocId::nil(),
            src_doc_class: ClassId::new("tracker:class:Issue"),
            attached_doc_id: Some(DocId::nil()),
            attached_doc_class: Some(ClassId::new("tracker:class:Issue")),
            attached_to: target,
            attached_to_class: ClassId::new("tracker:class:Issue"),
            message: message.into(),
        }
    }

    fn inner_kind(tx: &Tx) -> TxKind {
        tx.extract().kind()
    }

    #[test]
    fn test_new_references_are_created() {
        let f = TxFactory::new(DocId::new());
        let wanted = vec![reference(DocId::new(), "a"), reference(DocId::new(), "b")];
        let diff = reconcile(&f, wanted.clone(), &[], &[]);
        assert!(diff.txes.is_empty());
        assert_eq!(diff.to_create, wanted);
    }

    #[test]
    fn test_unchanged_reference_is_kept() {
        let f = TxFactory::new(DocId::new());
        let target = DocId::new();
        let stored = reference(target, r#"{"type":"paragraph"}"#);
        let wanted = reference(target, r#"{ "type": "paragraph" }"#);
        let diff = reconcile(&f, vec![wanted], &[stored], &[]);
        assert!(diff.txes.is_empty());
        assert!(diff.to_create.is_empty());
    }

    #[test]
    fn test_changed_excerpt_updates_in_place() {
        let f = TxFactory::new(DocId::new());
        let target = DocId::new();
        let stored = reference(target, "old");
        let diff = reconcile(&f, vec![reference(target, "new")], &[stored.clone()], &[]);
        assert!(diff.to_create.is_empty());
        assert_eq!(diff.txes.len(), 1);
        let inner = diff.txes[0].extract();
        assert_eq!(inner.kind(), TxKind::Update);
        assert_eq!(inner.object_id, stored.id);
        assert_eq!(diff.txes[0].object_id, target);
    }

    #[test]
    fn test_dropped_reference_is_removed() {
        let f = TxFactory::new(DocId::new());
        let stored = reference(DocId::new(), "x");
        let diff = reconcile(&f, Vec::new(), &[stored.clone()], &[]);
        assert_eq!(diff.txes.len(), 1);
        assert_eq!(inner_kind(&diff.txes[0]), TxKind::Remove);
        assert_eq!(diff.txes[0].extract().object_id, stored.id);
    }

    #[test]
    fn test_marker_with_same_content_suppresses_mention() {
        let f = TxFactory::new(DocId::new());
        let person = DocId::new();
        let wanted = reference(person, "hello");
        let marker = MentionMarker {
            id: DocId::new(),
            space: DocId::nil(),
            user: person,
            attached_to: wanted.mention_anchor(),
            attached_to_class: wanted.mention_anchor_class(),
            content: "hello".into(),
        };
        let diff = reconcile(&f, vec![wanted.clone()], &[], &[marker.clone()]);
        assert!(diff.txes.is_empty());
        assert!(diff.to_create.is_empty());

        let edited = reference(person, "hello again");
        let diff = reconcile(&f, vec![edited.clone()], &[], &[marker]);
        assert!(diff.txes.is_empty());
        assert_eq!(diff.to_create, vec![edited]);
    }

    #[test]
    fn test_marker_of_unmentioned_user_is_removed() {
        let f = TxFactory::new(DocId::new());
        let marker = MentionMarker {
            id: DocId::new(),
            space: DocId::nil(),
            user: DocId::new(),
            attached_to: DocId::nil(),
            attached_to_class: ClassId::new("tracker:class:Issue"),
            content: "gone".into(),
        };
        let diff = reconcile(&f, Vec::new(), &[], &[marker.clone()]);
        assert_eq!(diff.txes.len(), 1);
        assert_eq!(diff.txes[0].extract().object_id, marker.id);
        assert_eq!(inner_kind(&diff.txes[0]), TxKind::Remove);
    }
}
