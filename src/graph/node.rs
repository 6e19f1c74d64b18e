//! Nodes and their memoized results.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use petgraph::stable_graph::NodeIndex;
use serde_json::Value;

use crate::catalog::types::NodeType;

/// Stable string identity of a node within one document.
pub type NodeId = String;

/// Immutable snapshot of one evaluation's socket outputs.
///
/// The fingerprint is a canonical content hash of the outputs; two results
/// with equal outputs share a fingerprint regardless of when or on which
/// node they were computed.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    outputs: BTreeMap<String, Value>,
    fingerprint: u64,
    computed_at: DateTime<Utc>,
}

impl NodeResult {
    pub fn new(outputs: BTreeMap<String, Value>) -> Self {
        let fingerprint = fingerprint_outputs(&outputs);
        Self {
            outputs,
            fingerprint,
            computed_at: Utc::now(),
        }
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn output(&self, socket: &str) -> Option<&Value> {
        self.outputs.get(socket)
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }
}

/// One placed node: type binding, parameter bag, and evaluation state.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    ty: Arc<NodeType>,
    params: BTreeMap<String, Value>,
    result: Option<Arc<NodeResult>>,
    dirty: bool,
    version: u64,
    seq: u64,
    pub(crate) index: NodeIndex,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        ty: Arc<NodeType>,
        params: BTreeMap<String, Value>,
        seq: u64,
        index: NodeIndex,
    ) -> Self {
        Self {
            id,
            ty,
            params,
            result: None,
            dirty: true,
            version: 0,
            seq,
            index,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_id(&self) -> &str {
        self.ty.id()
    }

    pub fn node_type(&self) -> &Arc<NodeType> {
        &self.ty
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Latest adopted result, if any evaluation has completed.
    pub fn result(&self) -> Option<&Arc<NodeResult>> {
        self.result.as_ref()
    }

    /// True when the node needs recomputation before its result can be
    /// trusted.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Monotonic count of adopted result changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Registration sequence; drives every deterministic ordering decision.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn set_param_value(&mut self, name: &str, value: Value) -> bool {
        match self.params.get(name) {
            Some(existing) if *existing == value => false,
            _ => {
                self.params.insert(name.to_string(), value);
                true
            }
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Adopt a result and clear the dirty flag. The version bumps only when
    /// the adopted content differs from what the node already holds.
    pub(crate) fn adopt_result(&mut self, result: Arc<NodeResult>) -> bool {
        let changed = self
            .result
            .as_ref()
            .map(|current| current.fingerprint() != result.fingerprint())
            .unwrap_or(true);
        if changed {
            self.version += 1;
            self.result = Some(result);
        }
        self.dirty = false;
        changed
    }
}

/// Canonical content hash over a JSON value. Object keys are visited in
/// sorted order so serialization quirks never affect the hash.
pub(crate) fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            n.hash(state);
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            for key in keys {
                key.hash(state);
                hash_value(&map[key], state);
            }
        }
    }
}

pub(crate) fn fingerprint_outputs(outputs: &BTreeMap<String, Value>) -> u64 {
    let mut hasher = DefaultHasher::new();
    outputs.len().hash(&mut hasher);
    for (socket, value) in outputs {
        socket.hash(&mut hasher);
        hash_value(value, &mut hasher);
    }
    hasher.finish()
}
