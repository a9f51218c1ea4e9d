//! Conversion between yrs XML fragments and [`MarkupNode`] trees.
//!
//! Each collaborative attribute is stored as one yrs document whose XML
//! fragment is named after the attribute. Elements map to nodes (tag to
//! type, XML attributes to attrs); XML text maps to text nodes.

use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Doc, GetString, Out, ReadTxn, StateVector, Transact, TransactionMut, Update, Xml, XmlElementPrelim,
    XmlFragment, XmlOut, XmlTextPrelim,
};

use super::MarkupNode;
use crate::error::{CoreError, CoreResult};

/// Decode a yrs v1 update and read the fragment `field` as a node tree.
pub fn nodes_from_collaborative(buffer: &[u8], field: &str) -> CoreResult<MarkupNode> {
    let doc = Doc::new();
    // The root type must exist before the update is integrated.
    let fragment = doc.get_or_insert_xml_fragment(field);
    let update = Update::decode_v1(buffer)?;
    {
        let mut txn = doc.transact_mut();
        apply(&mut txn, update)?;
    }

    let txn = doc.transact();
    let mut root = MarkupNode::new("doc");
    for i in 0..fragment.len(&txn) {
        if let Some(child) = fragment.get(&txn, i) {
            root.content.push(xml_to_node(&txn, child));
        }
    }
    Ok(root)
}

/// Encode a node tree as a full yrs state update under fragment `field`.
pub fn nodes_to_collaborative(root: &MarkupNode, field: &str) -> Vec<u8> {
    let doc = Doc::new();
    let fragment = doc.get_or_insert_xml_fragment(field);
    {
        let mut txn = doc.transact_mut();
        for child in &root.content {
            write_node(&mut txn, &fragment, child);
        }
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Integrate `update` into the stored state `current` and return the
/// merged full state.
pub fn merge_update(current: Option<&[u8]>, update: &[u8]) -> CoreResult<Vec<u8>> {
    let doc = Doc::new();
    let incoming = Update::decode_v1(update)?;
    {
        let mut txn = doc.transact_mut();
        if let Some(current) = current {
            apply(&mut txn, Update::decode_v1(current)?)?;
        }
        apply(&mut txn, incoming)?;
    }
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&StateVector::default()))
}

fn apply(txn: &mut TransactionMut, update: Update) -> CoreResult<()> {
    txn.apply_update(update)
        .map_err(|e| CoreError::Collaborative(format!("cannot apply update: {e}")))
}

fn xml_to_node<T: ReadTxn>(txn: &T, node: XmlOut) -> MarkupNode {
    match node {
        XmlOut::Element(el) => {
            let mut out = MarkupNode::new(el.tag().to_string());
            for (name, value) in el.attributes(txn) {
                out.attrs.insert(name.to_string(), attr_value(txn, value));
            }
            for i in 0..el.len(txn) {
                if let Some(child) = el.get(txn, i) {
                    out.content.push(xml_to_node(txn, child));
                }
            }
            out
        }
        XmlOut::Fragment(fragment) => {
            let mut out = MarkupNode::new("doc");
            for i in 0..fragment.len(txn) {
                if let Some(child) = fragment.get(txn, i) {
                    out.content.push(xml_to_node(txn, child));
                }
            }
            out
        }
        XmlOut::Text(text) => MarkupNode::text(text.get_string(txn)),
    }
}

fn attr_value<T: ReadTxn>(txn: &T, value: Out) -> Value {
    match value {
        Out::Any(Any::String(s)) => Value::String(s.to_string()),
        Out::Any(Any::Bool(b)) => Value::Bool(b),
        Out::Any(Any::Number(n)) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Out::Any(Any::BigInt(n)) => Value::from(n),
        Out::Any(Any::Null) | Out::Any(Any::Undefined) => Value::Null,
        other => Value::String(other.to_string(txn)),
    }
}

fn write_node<F: XmlFragment>(txn: &mut TransactionMut, parent: &F, node: &MarkupNode) {
    if let Some(text) = &node.text {
        parent.push_back(txn, XmlTextPrelim::new(text.as_str()));
        return;
    }
    let el = parent.push_back(txn, XmlElementPrelim::empty(node.node_type.as_str()));
    for (name, value) in &node.attrs {
        let value: String = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        el.insert_attribute(txn, name.as_str(), value);
    }
    for child in &node.content {
        write_node(txn, &el, child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{class, DocId};
    use crate::markup::{extract_references, parse_markup, to_markup};

    #[test]
    fn test_reads_fragment_built_with_yrs() {
        let id = DocId::new();
        let doc = Doc::new();
        let fragment = doc.get_or_insert_xml_fragment("description");
        {
            let mut txn = doc.transact_mut();
            let p = fragment.push_back(&mut txn, XmlElementPrelim::empty("paragraph"));
            p.push_back(&mut txn, XmlTextPrelim::new("hello "));
            let r = p.push_back(&mut txn, XmlElementPrelim::empty("reference"));
            r.insert_attribute(&mut txn, "id", id.to_string());
            r.insert_attribute(&mut txn, "objectclass", "contact:class:Person");
        }
        let update = doc.transact().encode_state_as_update_v1(&StateVector::default());

        let root = nodes_from_collaborative(&update, "description").unwrap();
        let refs = extract_references(&root);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].object_id, id);
        assert_eq!(refs[0].object_class, class::PERSON);
    }

    #[test]
    fn test_collaborative_and_markup_give_identical_references() {
        let id = DocId::new();
        let markup = MarkupNode::new("doc").with_child(
            MarkupNode::new("paragraph")
                .with_child(MarkupNode::text("see "))
                .with_child(
                    MarkupNode::new("reference")
                        .with_attr("id", id.to_string())
                        .with_attr("objectclass", "tracker:class:Issue"),
                ),
        );
        let buffer = nodes_to_collaborative(&markup, "content");

        let from_collab = extract_references(&nodes_from_collaborative(&buffer, "content").unwrap());
        let from_markup = extract_references(&parse_markup(&to_markup(&markup)).unwrap());
        assert_eq!(from_collab, from_markup);
    }

    #[test]
    fn test_other_field_is_empty() {
        let markup = MarkupNode::new("doc").with_child(MarkupNode::new("paragraph"));
        let buffer = nodes_to_collaborative(&markup, "content");
        let root = nodes_from_collaborative(&buffer, "description").unwrap();
        assert!(root.content.is_empty());
    }

    #[test]
    fn test_merge_update_keeps_both_edits() {
        let first = MarkupNode::new("doc")
            .with_child(MarkupNode::new("paragraph").with_child(MarkupNode::text("one")));
        let second = MarkupNode::new("doc")
            .with_child(MarkupNode::new("paragraph").with_child(MarkupNode::text("two")));
        let a = nodes_to_collaborative(&first, "content");
        let b = nodes_to_collaborative(&second, "content");

        let merged = merge_update(Some(&a), &b).unwrap();
        let root = nodes_from_collaborative(&merged, "content").unwrap();
        assert_eq!(root.content.len(), 2);

        let fresh = merge_update(None, &a).unwrap();
        let root = nodes_from_collaborative(&fresh, "content").unwrap();
        assert_eq!(root, first);
    }

    #[test]
    fn test_garbage_buffer_is_an_error() {
        assert!(nodes_from_collaborative(&[0xff, 0xff, 0xff], "content").is_err());
    }

    #[test]
    fn test_merge_rejects_corrupt_state() {
        let update = nodes_to_collaborative(&MarkupNode::new("doc"), "content");
        let stored = merge_update(Some(&[0xff, 0xff, 0xff]), &update);
        assert!(matches!(stored, Err(CoreError::Collaborative(_))));
        let incoming = merge_update(Some(&update), &[0xff, 0xff, 0xff]);
        assert!(matches!(incoming, Err(CoreError::Collaborative(_))));
    }
}
