//! The editable parametric graph.
//!
//! Topology lives in a petgraph `StableDiGraph` (indices stay valid across
//! removals) next to a node map keyed by id. Every edit validates first,
//! then marks the affected downstream set dirty and returns it, so callers
//! always know exactly what an edit invalidated.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use petgraph::dot::Dot;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde_json::Value;
use tracing::debug;

use crate::catalog::registry::NodeTypeRegistry;
use crate::error::{EngineError, EngineResult, SocketKind};
use crate::graph::invalidate;
use crate::graph::node::{Node, NodeId, NodeResult};

/// Socket pair carried on each topology edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Binding {
    pub source_socket: String,
    pub target_socket: String,
}

/// Read view of one binding between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: NodeId,
    pub source_socket: String,
    pub target: NodeId,
    pub target_socket: String,
}

/// A parametric document: placed nodes plus the bindings between them.
///
/// Node types resolve against the registry once, when a node enters the
/// graph. Cycles are representable here; they surface as an error when an
/// evaluation actually needs the cyclic region.
#[derive(Debug)]
pub struct Graph {
    registry: NodeTypeRegistry,
    nodes: HashMap<NodeId, Node>,
    topology: StableDiGraph<NodeId, Binding>,
    next_seq: u64,
}

impl Graph {
    pub fn new(registry: NodeTypeRegistry) -> Self {
        Self {
            registry,
            nodes: HashMap::new(),
            topology: StableDiGraph::new(),
            next_seq: 0,
        }
    }

    pub fn registry(&self) -> &NodeTypeRegistry {
        &self.registry
    }

    /// Place a node of `type_id` with generated id. `overrides` replace the
    /// schema defaults for the named parameters.
    ///
    /// Returns the new node's id; the node starts dirty.
    pub fn add_node(
        &mut self,
        type_id: &str,
        overrides: BTreeMap<String, Value>,
    ) -> EngineResult<NodeId> {
        let id = cuid2::create_id();
        self.insert_node(id.clone(), type_id, overrides)?;
        Ok(id)
    }

    /// Place a node under a caller-chosen id, failing on collisions.
    /// Document loading goes through here to preserve authored ids.
    pub fn add_node_with_id(
        &mut self,
        id: impl Into<NodeId>,
        type_id: &str,
        overrides: BTreeMap<String, Value>,
    ) -> EngineResult<NodeId> {
        let id = id.into();
        self.insert_node(id.clone(), type_id, overrides)?;
        Ok(id)
    }

    fn insert_node(
        &mut self,
        id: NodeId,
        type_id: &str,
        overrides: BTreeMap<String, Value>,
    ) -> EngineResult<()> {
        if self.nodes.contains_key(&id) {
            return Err(EngineError::duplicate_node(id));
        }
        let ty = self.registry.resolve(type_id)?;
        let mut params = ty.default_params();
        params.extend(overrides);

        let index = self.topology.add_node(id.clone());
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(node_id = %id, type_id, seq, "added node");
        self.nodes.insert(id.clone(), Node::new(id, ty, params, seq, index));
        Ok(())
    }

    /// Remove a node and its bindings. Returns the downstream nodes this
    /// dirtied (the removed node itself is gone, not dirty).
    pub fn remove_node(&mut self, id: &str) -> EngineResult<Vec<NodeId>> {
        let index = self.require(id)?.index;
        let mut downstream = invalidate::downstream_closure(self, &[id]);
        downstream.retain(|other| other != id);

        self.topology.remove_node(index);
        self.nodes.remove(id);
        debug!(node_id = %id, dirtied = downstream.len(), "removed node");

        Ok(invalidate::mark_downstream_ids(self, downstream))
    }

    /// Connect `source.source_socket` into `target.target_socket`.
    ///
    /// Validates both sockets and their semantic compatibility. An existing
    /// binding on the target socket is replaced; an input holds at most one
    /// upstream. Cycles are not checked here.
    pub fn bind(
        &mut self,
        source: &str,
        source_socket: &str,
        target: &str,
        target_socket: &str,
    ) -> EngineResult<Vec<NodeId>> {
        let (source_index, source_semantic) = {
            let node = self.require(source)?;
            let socket = node.node_type().output(source_socket).ok_or_else(|| {
                EngineError::socket_not_found(node.type_id(), SocketKind::Output, source_socket)
            })?;
            (node.index, socket.semantic)
        };
        let (target_index, target_semantic) = {
            let node = self.require(target)?;
            let socket = node.node_type().input(target_socket).ok_or_else(|| {
                EngineError::socket_not_found(node.type_id(), SocketKind::Input, target_socket)
            })?;
            (node.index, socket.semantic)
        };
        if !source_semantic.is_compatible(target_semantic) {
            return Err(EngineError::TypeMismatch {
                source_id: source.to_string(),
                source_socket: source_socket.to_string(),
                source_type: source_semantic.to_string(),
                target: target.to_string(),
                target_socket: target_socket.to_string(),
                target_type: target_semantic.to_string(),
            });
        }

        if let Some(edge) = self.edge_into(target_index, target_socket) {
            self.topology.remove_edge(edge);
        }
        self.topology.add_edge(
            source_index,
            target_index,
            Binding {
                source_socket: source_socket.to_string(),
                target_socket: target_socket.to_string(),
            },
        );
        debug!(
            source = %source, source_socket, target = %target, target_socket,
            "bound sockets"
        );
        Ok(invalidate::mark_downstream(self, &[target]))
    }

    /// Disconnect whatever feeds `target.target_socket`. Unbound sockets
    /// are left alone and dirty nothing.
    pub fn unbind(&mut self, target: &str, target_socket: &str) -> EngineResult<Vec<NodeId>> {
        let target_index = {
            let node = self.require(target)?;
            if node.node_type().input(target_socket).is_none() {
                return Err(EngineError::socket_not_found(
                    node.type_id(),
                    SocketKind::Input,
                    target_socket,
                ));
            }
            node.index
        };
        match self.edge_into(target_index, target_socket) {
            Some(edge) => {
                self.topology.remove_edge(edge);
                debug!(target = %target, target_socket, "unbound socket");
                Ok(invalidate::mark_downstream(self, &[target]))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Set one parameter. Setting a parameter to its current value is a
    /// no-op and dirties nothing. Names are not checked against the schema
    /// here; evaluation rejects undeclared or out-of-bounds parameters.
    pub fn set_param(&mut self, id: &str, name: &str, value: Value) -> EngineResult<Vec<NodeId>> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EngineError::node_not_found(id))?;
        if !node.set_param_value(name, value) {
            return Ok(Vec::new());
        }
        debug!(node_id = %id, param = name, "parameter changed");
        Ok(invalidate::mark_downstream(self, &[id]))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub(crate) fn require(&self, id: &str) -> EngineResult<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::node_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in registration order.
    pub fn nodes(&self) -> Vec<&Node> {
        let mut all: Vec<&Node> = self.nodes.values().collect();
        all.sort_by_key(|node| node.seq());
        all
    }

    /// All node ids in registration order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes()
            .into_iter()
            .map(|node| node.id().to_string())
            .collect()
    }

    /// Ids of every dirty node, in registration order.
    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .into_iter()
            .filter(|node| node.dirty())
            .map(|node| node.id().to_string())
            .collect()
    }

    /// Every binding, ordered by target registration then target socket.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .topology
            .edge_references()
            .map(|edge| Edge {
                source: self.topology[edge.source()].clone(),
                source_socket: edge.weight().source_socket.clone(),
                target: self.topology[edge.target()].clone(),
                target_socket: edge.weight().target_socket.clone(),
            })
            .collect();
        edges.sort_by(|a, b| {
            let a_seq = self.nodes.get(&a.target).map(Node::seq);
            let b_seq = self.nodes.get(&b.target).map(Node::seq);
            a_seq
                .cmp(&b_seq)
                .then_with(|| a.target_socket.cmp(&b.target_socket))
        });
        edges
    }

    /// The binding feeding `target_socket` of `id`, if any.
    pub fn input_binding(&self, id: &str, target_socket: &str) -> Option<(NodeId, String)> {
        let index = self.nodes.get(id)?.index;
        self.topology
            .edges_directed(index, Direction::Incoming)
            .find(|edge| edge.weight().target_socket == target_socket)
            .map(|edge| {
                (
                    self.topology[edge.source()].clone(),
                    edge.weight().source_socket.clone(),
                )
            })
    }

    /// Direct upstream node ids of `id`, deduplicated, in registration
    /// order. Unknown ids yield an empty list.
    pub fn upstream_of(&self, id: &str) -> Vec<NodeId> {
        self.adjacent(id, Direction::Incoming)
    }

    /// Direct downstream node ids of `id`, deduplicated, in registration
    /// order. Unknown ids yield an empty list.
    pub fn downstream_of(&self, id: &str) -> Vec<NodeId> {
        self.adjacent(id, Direction::Outgoing)
    }

    fn adjacent(&self, id: &str, direction: Direction) -> Vec<NodeId> {
        let Some(node) = self.nodes.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<NodeId> = self
            .topology
            .neighbors_directed(node.index, direction)
            .map(|index| self.topology[index].clone())
            .collect();
        ids.sort_by_key(|other| self.nodes.get(other).map(Node::seq));
        ids.dedup();
        ids
    }

    /// Graphviz rendering of the topology, dirty nodes marked.
    pub fn to_dot(&self) -> String {
        let rendered = self.topology.map(
            |_, id| match self.nodes.get(id) {
                Some(node) if node.dirty() => format!("{} [{}]*", id, node.type_id()),
                Some(node) => format!("{} [{}]", id, node.type_id()),
                None => id.clone(),
            },
            |_, binding| format!("{}->{}", binding.source_socket, binding.target_socket),
        );
        format!("{}", Dot::new(&rendered))
    }

    pub(crate) fn mark_node_dirty(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.mark_dirty();
        }
    }

    /// Adopt an evaluation result for `id`. Returns whether the node's
    /// content actually changed.
    pub(crate) fn adopt_result(&mut self, id: &str, result: Arc<NodeResult>) -> EngineResult<bool> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EngineError::node_not_found(id))?;
        Ok(node.adopt_result(result))
    }

    fn edge_into(&self, target: NodeIndex, target_socket: &str) -> Option<EdgeIndex> {
        self.topology
            .edges_directed(target, Direction::Incoming)
            .find(|edge| edge.weight().target_socket == target_socket)
            .map(|edge| edge.id())
    }
}
