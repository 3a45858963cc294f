//! Bidirectional translation between the structured-content tree and the
//! CRDT document tree.
//!
//! The two shapes are structurally isomorphic:
//!
//! - `doc { content: [node...] }` ↔ the root XML fragment
//! - `element { type, attrs?, content? }` ↔ an XML element with tag `type`
//! - `text { text, marks? }` ↔ a chunk of an XML text node whose marks are
//!   formatting attributes
//!
//! Consecutive text leaves of an element collapse into a single CRDT text
//! node with per-range formatting; the reverse direction splits ranges back
//! into one text leaf per uniform mark set.
//!
//! Typing policy: the `level` attribute is numeric on the JSON side and a
//! canonical integer string inside the CRDT; every other attribute value is
//! stored as a string. Empty content arrays are elided when reading back.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use vellum_types::content::{ContentNode, Mark, TEXT_TYPE};
use yrs::types::text::YChange;
use yrs::types::{Attrs, Value as YValue};
use yrs::{
    Any, Doc, ReadTxn, Text, Transact, TransactionMut, Xml, XmlElementPrelim, XmlElementRef,
    XmlFragment, XmlFragmentRef, XmlNode, XmlTextPrelim, XmlTextRef,
};

/// Name of the root fragment every document lives under.
pub(crate) const ROOT_FRAGMENT: &str = "content";

/// The attribute whose value is coerced between string and integer.
const LEVEL_ATTR: &str = "level";

/// Returns the root fragment of a document, creating it if necessary.
pub(crate) fn root_fragment(doc: &Doc) -> XmlFragmentRef {
    doc.get_or_insert_xml_fragment(ROOT_FRAGMENT)
}

/// Removes every child of the fragment.
pub(crate) fn clear(txn: &mut TransactionMut<'_>, fragment: &XmlFragmentRef) {
    let len = fragment.len(txn);
    if len > 0 {
        fragment.remove_range(txn, 0, len);
    }
}

/// Lifts a content tree into the fragment, appending after any existing
/// children.
///
/// Callers are expected to run lift (and any preceding [`clear`]) inside a
/// single transaction so that no partial state is observable to peers.
pub(crate) fn lift_into(
    txn: &mut TransactionMut<'_>,
    fragment: &XmlFragmentRef,
    tree: &ContentNode,
) {
    lift_children(txn, fragment, tree.children());
}

fn lift_children<F: XmlFragment>(txn: &mut TransactionMut<'_>, parent: &F, children: &[ContentNode]) {
    let mut idx = 0;
    while idx < children.len() {
        let child = &children[idx];
        if child.kind == TEXT_TYPE {
            // collapse the run of consecutive text leaves into one text node
            let run_end = children[idx..]
                .iter()
                .position(|n| n.kind != TEXT_TYPE)
                .map(|off| idx + off)
                .unwrap_or(children.len());
            let text: XmlTextRef = parent.push_back(txn, XmlTextPrelim::new(""));
            for leaf in &children[idx..run_end] {
                lift_text_chunk(txn, &text, leaf);
            }
            idx = run_end;
        } else {
            let element: XmlElementRef =
                parent.push_back(txn, XmlElementPrelim::empty(child.kind.as_str()));
            if let Some(attrs) = &child.attrs {
                for (key, value) in attrs {
                    element.insert_attribute(txn, key.as_str(), attr_to_string(key, value));
                }
            }
            lift_children(txn, &element, child.children());
            idx += 1;
        }
    }
}

fn lift_text_chunk(txn: &mut TransactionMut<'_>, text: &XmlTextRef, leaf: &ContentNode) {
    let chunk = leaf.text.as_deref().unwrap_or_default();
    if chunk.is_empty() {
        return;
    }
    let at = text.len(txn);
    match leaf.marks.as_deref() {
        Some(marks) if !marks.is_empty() => {
            text.insert_with_attributes(txn, at, chunk, marks_to_attrs(marks));
        }
        _ => text.insert(txn, at, chunk),
    }
}

/// Reads the fragment back into a content tree rooted at a `doc` node.
pub(crate) fn to_content<T: ReadTxn>(txn: &T, fragment: &XmlFragmentRef) -> ContentNode {
    let children = read_children(txn, fragment);
    ContentNode {
        kind: "doc".to_owned(),
        attrs: None,
        content: if children.is_empty() {
            None
        } else {
            Some(children)
        },
        text: None,
        marks: None,
    }
}

/// Convenience wrapper reading the whole document in a fresh read
/// transaction.
pub(crate) fn doc_to_content(doc: &Doc) -> ContentNode {
    let fragment = root_fragment(doc);
    let txn = doc.transact();
    to_content(&txn, &fragment)
}

fn read_children<T: ReadTxn, F: XmlFragment>(txn: &T, fragment: &F) -> Vec<ContentNode> {
    let mut out = Vec::new();
    for idx in 0..fragment.len(txn) {
        match fragment.get(txn, idx) {
            Some(XmlNode::Element(element)) => out.push(read_element(txn, &element)),
            Some(XmlNode::Text(text)) => out.extend(read_text(txn, &text)),
            Some(XmlNode::Fragment(nested)) => out.extend(read_children(txn, &nested)),
            None => {}
        }
    }
    out
}

fn read_element<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> ContentNode {
    let mut attrs = serde_json::Map::new();
    for (key, value) in element.attributes(txn) {
        attrs.insert(key.to_owned(), attr_from_string(key, value));
    }
    let children = read_children(txn, element);
    ContentNode {
        kind: element.tag().to_string(),
        attrs: if attrs.is_empty() { None } else { Some(attrs) },
        content: if children.is_empty() {
            None
        } else {
            Some(children)
        },
        text: None,
        marks: None,
    }
}

fn read_text<T: ReadTxn>(txn: &T, text: &XmlTextRef) -> Vec<ContentNode> {
    let mut out = Vec::new();
    for diff in text.diff(txn, YChange::identity) {
        let YValue::Any(Any::String(chunk)) = diff.insert else {
            continue;
        };
        let marks = diff
            .attributes
            .map(|attrs| attrs_to_marks(&attrs))
            .filter(|marks| !marks.is_empty());
        out.push(ContentNode {
            kind: TEXT_TYPE.to_owned(),
            attrs: None,
            content: None,
            text: Some(chunk.to_string()),
            marks,
        });
    }
    out
}

/// Stringifies an attribute value for storage inside the CRDT.
///
/// `level` is normalized through its integer value so that both `3` and
/// `"3"` lift to the same state.
fn attr_to_string(key: &str, value: &Value) -> String {
    if key == LEVEL_ATTR
        && let Some(level) = value_as_i64(value)
    {
        return level.to_string();
    }
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// The inverse coercion: `level` becomes an integer, everything else stays
/// a string.
fn attr_from_string(key: &str, value: String) -> Value {
    if key == LEVEL_ATTR
        && let Ok(level) = value.parse::<i64>()
    {
        return Value::Number(level.into());
    }
    Value::String(value)
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn marks_to_attrs(marks: &[Mark]) -> Attrs {
    let mut attrs: Attrs = HashMap::new();
    for mark in marks {
        let value = match &mark.attrs {
            Some(map) => json_map_to_any(map),
            None => Any::Map(Arc::new(HashMap::new())),
        };
        attrs.insert(Arc::from(mark.kind.as_str()), value);
    }
    attrs
}

fn attrs_to_marks(attrs: &Attrs) -> Vec<Mark> {
    let mut marks: Vec<Mark> = attrs
        .iter()
        .map(|(kind, value)| Mark {
            kind: kind.to_string(),
            attrs: match value {
                Any::Map(map) if !map.is_empty() => {
                    let mut attrs = serde_json::Map::new();
                    for (key, value) in map.iter() {
                        attrs.insert(key.clone(), any_to_json(value));
                    }
                    Some(attrs)
                }
                _ => None,
            },
        })
        .collect();
    // formatting attributes come out of a hash map; keep the mark order
    // deterministic for structural comparison
    marks.sort_by(|a, b| a.kind.cmp(&b.kind));
    marks
}

fn json_map_to_any(map: &serde_json::Map<String, Value>) -> Any {
    let mut out = HashMap::with_capacity(map.len());
    for (key, value) in map {
        out.insert(key.clone(), json_to_any(value));
    }
    Any::Map(Arc::new(out))
}

fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                Any::BigInt(int)
            } else {
                Any::Number(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect()),
        Value::Object(map) => json_map_to_any(map),
    }
}

fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(int) => Value::Number((*int).into()),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(_) => Value::Null,
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map.iter() {
                out.insert(key.clone(), any_to_json(value));
            }
            Value::Object(out)
        }
    }
}
