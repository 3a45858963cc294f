//! The structured-content tree model.
//!
//! Documents are stored in two redundant shapes: an opaque CRDT state blob
//! and a denormalized JSON tree. This module defines the JSON shape: a tree
//! of typed nodes, each with an optional attribute map and either child
//! nodes or a text leaf with an optional mark set.
//!
//! ```json
//! {
//!   "type": "doc",
//!   "content": [
//!     { "type": "paragraph", "content": [
//!       { "type": "text", "text": "hi", "marks": [{ "type": "bold" }] }
//!     ]}
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The node type of the tree root.
pub const DOC_TYPE: &str = "doc";
/// The node type of text leaves.
pub const TEXT_TYPE: &str = "text";

/// A single node of the content tree.
///
/// Element nodes carry a `type`, an optional attribute map, and child nodes.
/// Text leaves carry a `text` string and an optional mark set. Fields that
/// are absent are elided during serialization so that trees round-trip
/// without noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    /// Node type (`doc`, `paragraph`, `heading`, `text`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form attribute map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<serde_json::Map<String, Value>>,
    /// Child nodes of an element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentNode>>,
    /// Text payload of a text leaf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Marks applied to a text leaf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marks: Option<Vec<Mark>>,
}

/// A mark applied to a text leaf (`bold`, `link`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    /// Mark type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional mark attributes (e.g. a link target).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<serde_json::Map<String, Value>>,
}

impl ContentNode {
    /// Creates an empty `doc` root.
    pub fn empty_doc() -> Self {
        Self {
            kind: DOC_TYPE.to_owned(),
            attrs: None,
            content: Some(Vec::new()),
            text: None,
            marks: None,
        }
    }

    /// Creates a text leaf.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: TEXT_TYPE.to_owned(),
            attrs: None,
            content: None,
            text: Some(text.into()),
            marks: None,
        }
    }

    /// Creates an element node with the given children.
    pub fn element(kind: impl Into<String>, content: Vec<ContentNode>) -> Self {
        Self {
            kind: kind.into(),
            attrs: None,
            content: Some(content),
            text: None,
            marks: None,
        }
    }

    /// `true` iff this node is a `doc` root.
    pub fn is_doc(&self) -> bool {
        self.kind == DOC_TYPE
    }

    /// Parses a stored content value into a tree.
    ///
    /// Returns `None` for anything that is not a well-formed `doc` root:
    /// non-object values, XML-like strings (leading `<`), or trees whose
    /// root type differs. Malformed content is treated as absent rather
    /// than as an error.
    pub fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if s.trim_start().starts_with('<') => None,
            Value::String(s) => {
                let inner: Value = serde_json::from_str(s).ok()?;
                Self::parse(&inner)
            }
            Value::Object(_) => {
                let node: ContentNode = serde_json::from_value(value.clone()).ok()?;
                node.is_doc().then_some(node)
            }
            _ => None,
        }
    }

    /// Children of this node, empty for leaves.
    pub fn children(&self) -> &[ContentNode] {
        self.content.as_deref().unwrap_or(&[])
    }

    /// A tree is effectively empty iff no recursive text-leaf descendant
    /// contains a non-whitespace character.
    pub fn is_effectively_empty(&self) -> bool {
        if let Some(text) = &self.text
            && !text.trim().is_empty()
        {
            return false;
        }
        self.children().iter().all(Self::is_effectively_empty)
    }

    /// Concatenates all text leaves of the subtree.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in self.children() {
            child.collect_text(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_doc_tree() {
        let value = json!({
            "type": "doc",
            "content": [
                { "type": "paragraph", "content": [{ "type": "text", "text": "hi" }] }
            ]
        });
        let tree = ContentNode::parse(&value).unwrap();
        assert!(tree.is_doc());
        assert_eq!(tree.children().len(), 1);
        assert_eq!(tree.plain_text(), "hi");
    }

    #[test]
    fn xml_like_and_malformed_content_is_absent() {
        assert!(ContentNode::parse(&json!("<p>legacy</p>")).is_none());
        assert!(ContentNode::parse(&json!(42)).is_none());
        assert!(ContentNode::parse(&json!({ "type": "paragraph" })).is_none());
        assert!(ContentNode::parse(&json!(null)).is_none());
    }

    #[test]
    fn stringified_json_content_is_accepted() {
        let value = json!("{\"type\":\"doc\",\"content\":[]}");
        assert!(ContentNode::parse(&value).is_some());
    }

    #[test]
    fn whitespace_only_trees_are_effectively_empty() {
        let tree = ContentNode::element(
            "doc",
            vec![ContentNode::element(
                "paragraph",
                vec![ContentNode::text("  \n\t ")],
            )],
        );
        assert!(tree.is_effectively_empty());

        let tree = ContentNode::element(
            "doc",
            vec![ContentNode::element(
                "paragraph",
                vec![ContentNode::text("  x ")],
            )],
        );
        assert!(!tree.is_effectively_empty());
    }

    #[test]
    fn serialization_elides_absent_fields() {
        let tree = ContentNode::text("hi");
        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(value, json!({ "type": "text", "text": "hi" }));
    }
}
