//! Document persistence: the YAML/JSON form of a graph.
//!
//! A document stores node ids, type ids, parameter bags, and socket
//! bindings. Results, versions, and dirty flags are session state and never
//! persist. Loading resolves every type against a registry once and replays
//! the document through the normal edit path, so malformed documents fail
//! with the same errors interactive edits do.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::catalog::registry::NodeTypeRegistry;
use crate::error::{EngineError, EngineResult};
use crate::graph::graph::Graph;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDoc {
    pub id: String,
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDoc {
    pub source: String,
    pub source_socket: String,
    pub target: String,
    pub target_socket: String,
}

/// Serialized graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDoc {
    #[serde(default)]
    pub nodes: Vec<NodeDoc>,
    #[serde(default)]
    pub edges: Vec<EdgeDoc>,
}

impl GraphDoc {
    /// Snapshot a live graph. Nodes appear in registration order with fully
    /// materialized parameter bags.
    pub fn from_graph(graph: &Graph) -> Self {
        let nodes = graph
            .nodes()
            .into_iter()
            .map(|node| NodeDoc {
                id: node.id().to_string(),
                type_id: node.type_id().to_string(),
                params: node.params().clone(),
            })
            .collect();
        let edges = graph
            .edges()
            .into_iter()
            .map(|edge| EdgeDoc {
                source: edge.source,
                source_socket: edge.source_socket,
                target: edge.target,
                target_socket: edge.target_socket,
            })
            .collect();
        Self { nodes, edges }
    }

    /// Rebuild a live graph, resolving node types against `registry`.
    ///
    /// Every node starts dirty; the first evaluation recomputes the
    /// document from scratch. Cycles in the document load fine and are
    /// caught when evaluation reaches them.
    pub fn into_graph(self, registry: NodeTypeRegistry) -> EngineResult<Graph> {
        let mut graph = Graph::new(registry);
        for node in self.nodes {
            graph.add_node_with_id(node.id, &node.type_id, node.params)?;
        }
        for edge in &self.edges {
            graph.bind(
                &edge.source,
                &edge.source_socket,
                &edge.target,
                &edge.target_socket,
            )?;
        }
        info!(
            nodes = graph.len(),
            edges = graph.edges().len(),
            "loaded graph document"
        );
        Ok(graph)
    }

    pub fn from_yaml(text: &str) -> EngineResult<Self> {
        serde_yaml::from_str(text).map_err(|err| EngineError::document("invalid YAML document", err))
    }

    pub fn to_yaml(&self) -> EngineResult<String> {
        serde_yaml::to_string(self)
            .map_err(|err| EngineError::document("failed to serialize document to YAML", err))
    }

    pub fn from_json(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text).map_err(|err| EngineError::document("invalid JSON document", err))
    }

    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| EngineError::document("failed to serialize document to JSON", err))
    }

    /// Read a document from disk, picking the format by file extension
    /// (`.json` is JSON, anything else parses as YAML).
    pub fn load_path(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            EngineError::document(format!("failed to read {}", path.display()), err)
        })?;
        if has_json_extension(path) {
            Self::from_json(&text)
        } else {
            Self::from_yaml(&text)
        }
    }

    /// Write a document to disk, picking the format by file extension.
    pub fn save_path(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let text = if has_json_extension(path) {
            self.to_json()?
        } else {
            self.to_yaml()?
        };
        std::fs::write(path, text).map_err(|err| {
            EngineError::document(format!("failed to write {}", path.display()), err)
        })
    }
}

fn has_json_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
