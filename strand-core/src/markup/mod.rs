//! Rich-text content model and reference extraction.
//!
//! Content arrives either as markup (ProseMirror-style JSON text) or as a
//! collaborative yrs document. Both decode into the same [`MarkupNode`]
//! tree, so the extractor never needs to know where the content came from.
//!
//! ```text
//! markup text ──parse──┐
//!                      ├──► MarkupNode tree ──extract_references──► [ExtractedReference]
//! yrs update ──decode──┘
//! ```

mod collaborative;

pub use collaborative::{merge_update, nodes_from_collaborative, nodes_to_collaborative};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::ids::{ClassId, DocId};

/// Node type that carries a mention.
pub const REFERENCE_NODE: &str = "reference";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub mark_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarkupNode {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<MarkupNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

impl MarkupNode {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            ..Self::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            node_type: "text".into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    pub fn with_child(mut self, child: MarkupNode) -> Self {
        self.content.push(child);
        self
    }

    /// A reference node pointing at `id` of class `class`.
    pub fn reference(id: DocId, class: &ClassId, label: &str) -> Self {
        Self::new(REFERENCE_NODE)
            .with_attr("id", id.to_string())
            .with_attr("objectclass", class.to_string())
            .with_attr("label", label)
    }

    fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(Value::as_str)
    }
}

/// Where a piece of content lives.
#[derive(Debug, Clone, Copy)]
pub enum Content<'a> {
    Markup(&'a str),
    Collaborative { buffer: &'a [u8], field: &'a str },
}

impl Content<'_> {
    pub fn to_nodes(&self) -> CoreResult<MarkupNode> {
        match self {
            Content::Markup(text) => parse_markup(text),
            Content::Collaborative { buffer, field } => nodes_from_collaborative(buffer, field),
        }
    }
}

/// A mention found in content.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedReference {
    pub object_id: DocId,
    pub object_class: ClassId,
    /// The enclosing node re-serialized as markup.
    pub parent_excerpt: String,
}

/// Parse markup text. Empty input is an empty document.
pub fn parse_markup(text: &str) -> CoreResult<MarkupNode> {
    if text.trim().is_empty() {
        return Ok(MarkupNode::new("doc"));
    }
    serde_json::from_str(text).map_err(|e| CoreError::Markup(e.to_string()))
}

pub fn to_markup(node: &MarkupNode) -> String {
    serde_json::to_string(node).unwrap_or_default()
}

/// Flatten a tree into plain text, one line per block.
pub fn to_plain_text(node: &MarkupNode) -> String {
    fn walk(node: &MarkupNode, out: &mut String) {
        if let Some(text) = &node.text {
            out.push_str(text);
        }
        if node.node_type == REFERENCE_NODE {
            if let Some(label) = node.attr_str("label") {
                out.push('@');
                out.push_str(label);
            }
        }
        for child in &node.content {
            walk(child, out);
        }
        if node.node_type == "paragraph" || node.node_type == "heading" {
            out.push('\n');
        }
    }
    let mut out = String::new();
    walk(node, &mut out);
    out.trim_end().to_string()
}

/// Collect every reference in document order (depth first).
pub fn extract_references(root: &MarkupNode) -> Vec<ExtractedReference> {
    fn walk(node: &MarkupNode, parent: Option<&MarkupNode>, out: &mut Vec<ExtractedReference>) {
        if node.node_type == REFERENCE_NODE {
            let id = node.attr_str("id").and_then(|s| s.parse::<DocId>().ok());
            let class = node.attr_str("objectclass");
            match (id, class) {
                (Some(object_id), Some(class)) => out.push(ExtractedReference {
                    object_id,
                    object_class: ClassId::new(class),
                    parent_excerpt: parent.map(to_markup).unwrap_or_default(),
                }),
                _ => log::debug!("Skipping reference node without a valid id/objectclass"),
            }
        }
        for child in &node.content {
            walk(child, Some(node), out);
        }
    }
    let mut out = Vec::new();
    walk(root, None, &mut out);
    out
}

/// Parse and extract in one step; unreadable content yields no references.
pub fn references_in(content: Content<'_>) -> Vec<ExtractedReference> {
    match content.to_nodes() {
        Ok(root) => extract_references(&root),
        Err(e) => {
            log::debug!("Ignoring unreadable content: {e}");
            Vec::new()
        }
    }
}

/// Compare two excerpts as JSON values, falling back to string equality.
pub fn excerpt_equal(a: &str, b: &str) -> bool {
    match (
        serde_json::from_str::<Value>(a),
        serde_json::from_str::<Value>(b),
    ) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}
