//! Debounced persistence of document state.
//!
//! Rooms buffer mutations for a short debounce interval and then write the
//! encoded CRDT state together with a patch of derived properties in a
//! single row update. The derived fields are extracted by scanning the
//! content tree for the four well-known planning nodes; an absent or empty
//! node writes an explicit `null`, which clears the stored field.
//!
//! Persistence failures are logged and dropped: the next mutation arms the
//! debounce again and retries naturally.

use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;
use vellum_types::content::ContentNode;

use crate::metrics::{METRICS_ID_COLLAB_PERSIST_ERROR, METRICS_ID_COLLAB_PERSIST_SUCCESS};
use crate::services::storage::StorageService;

/// The derived fields: content node type → property key.
const DERIVED_FIELDS: &[(&str, &str)] = &[
    ("hypothesis", "hypothesis"),
    ("successCriteria", "successCriteria"),
    ("vision", "vision"),
    ("goals", "goals"),
];

/// Scans the content tree and builds the property patch for the four
/// well-known fields.
///
/// The patch always contains all four keys so that a removed node clears
/// its stored counterpart.
pub(crate) fn derive_properties(tree: &ContentNode) -> serde_json::Map<String, Value> {
    let mut patch = serde_json::Map::new();
    for (node_type, property) in DERIVED_FIELDS {
        let value = find_node(tree, node_type)
            .map(|node| node.plain_text().trim().to_owned())
            .filter(|text| !text.is_empty())
            .map(Value::String)
            .unwrap_or(Value::Null);
        patch.insert((*property).to_owned(), value);
    }
    patch
}

fn find_node<'a>(node: &'a ContentNode, kind: &str) -> Option<&'a ContentNode> {
    if node.kind == kind {
        return Some(node);
    }
    node.children()
        .iter()
        .find_map(|child| find_node(child, kind))
}

/// Writes one document row: CRDT state plus the derived-property patch.
#[instrument(level = "debug", skip(storage, crdt_state, content))]
pub(crate) async fn persist_document(
    storage: &StorageService,
    doc_id: Uuid,
    crdt_state: &[u8],
    content: &ContentNode,
) {
    let properties = derive_properties(content);
    match storage.save_document(doc_id, crdt_state, &properties).await {
        Ok(()) => {
            ::metrics::counter!(METRICS_ID_COLLAB_PERSIST_SUCCESS).increment(1);
            tracing::debug!(bytes = crdt_state.len(), "persisted document state");
        }
        Err(err) => {
            ::metrics::counter!(METRICS_ID_COLLAB_PERSIST_ERROR).increment(1);
            // dropped on purpose, the next debounced write retries
            tracing::warn!("could not persist document: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(value: Value) -> ContentNode {
        ContentNode::parse(&value).expect("well-formed tree")
    }

    #[test]
    fn extracts_present_fields_and_clears_missing_ones() {
        let content = tree(json!({
            "type": "doc",
            "content": [
                { "type": "hypothesis", "content": [
                    { "type": "paragraph", "content": [{ "type": "text", "text": "we think" }] }
                ]},
                { "type": "goals", "content": [
                    { "type": "paragraph", "content": [{ "type": "text", "text": "   " }] }
                ]}
            ]
        }));
        let patch = derive_properties(&content);
        assert_eq!(patch.get("hypothesis"), Some(&json!("we think")));
        // whitespace-only counts as cleared
        assert_eq!(patch.get("goals"), Some(&json!(null)));
        assert_eq!(patch.get("vision"), Some(&json!(null)));
        assert_eq!(patch.get("successCriteria"), Some(&json!(null)));
        assert_eq!(patch.len(), 4);
    }

    #[test]
    fn finds_fields_below_the_top_level() {
        let content = tree(json!({
            "type": "doc",
            "content": [
                { "type": "section", "content": [
                    { "type": "vision", "content": [
                        { "type": "paragraph", "content": [{ "type": "text", "text": "far" }] }
                    ]}
                ]}
            ]
        }));
        let patch = derive_properties(&content);
        assert_eq!(patch.get("vision"), Some(&json!("far")));
    }
}
