use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One node or edge. The editor owns the schema; the backend passes it through.
pub type Record = Map<String, Value>;

/// A saved graph: nodes and edges, both required, both opaque.
///
/// Unknown top-level fields are dropped on deserialization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDocument {
    pub nodes: Vec<Record>,
    pub edges: Vec<Record>,
}

impl FlowDocument {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_preserves_records() {
        let doc: FlowDocument = serde_json::from_value(json!({
            "nodes": [{"id": "1", "data": {"label": "Input", "nested": [1, 2]}}],
            "edges": [{"id": "e1", "source": "1", "target": "2"}]
        }))
        .unwrap();

        assert_eq!(doc.nodes.len(), 1);
        assert_eq!(doc.nodes[0]["data"]["nested"], json!([1, 2]));
        assert_eq!(doc.edges[0]["target"], "2");
    }

    #[test]
    fn missing_edges_is_rejected() {
        let result = serde_json::from_value::<FlowDocument>(json!({ "nodes": [] }));
        assert!(result.is_err());
    }

    #[test]
    fn non_object_records_are_rejected() {
        let result = serde_json::from_value::<FlowDocument>(json!({
            "nodes": [1, 2],
            "edges": []
        }));
        assert!(result.is_err());
    }

    #[test]
    fn extra_top_level_fields_are_ignored() {
        let doc: FlowDocument = serde_json::from_value(json!({
            "nodes": [],
            "edges": [],
            "viewport": {"zoom": 0.5}
        }))
        .unwrap();
        assert!(doc.is_empty());
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({"nodes": [], "edges": []})
        );
    }
}
