//! Dirty propagation.
//!
//! Every edit funnels through here so "the downstream set" has exactly one
//! definition: the edited nodes plus everything transitively reachable over
//! outgoing bindings, in registration order.

use std::collections::HashSet;

use tracing::trace;

use crate::graph::graph::Graph;
use crate::graph::node::NodeId;

/// Transitive downstream closure of `roots` (roots included), deduplicated
/// and sorted by registration sequence. Unknown roots contribute nothing.
pub fn downstream_closure(graph: &Graph, roots: &[&str]) -> Vec<NodeId> {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut frontier: Vec<NodeId> = Vec::new();
    for root in roots {
        if graph.contains(root) && seen.insert((*root).to_string()) {
            frontier.push((*root).to_string());
        }
    }
    while let Some(id) = frontier.pop() {
        for next in graph.downstream_of(&id) {
            if seen.insert(next.clone()) {
                frontier.push(next);
            }
        }
    }

    let mut closure: Vec<NodeId> = seen.into_iter().collect();
    closure.sort_by_key(|id| graph.node(id).map(|node| node.seq()));
    closure
}

/// Mark the downstream closure of `roots` dirty and return it.
pub(crate) fn mark_downstream(graph: &mut Graph, roots: &[&str]) -> Vec<NodeId> {
    let closure = downstream_closure(graph, roots);
    mark_downstream_ids(graph, closure)
}

/// Mark an already-computed id set dirty. Ids must be sorted the way
/// `downstream_closure` sorts them.
pub(crate) fn mark_downstream_ids(graph: &mut Graph, ids: Vec<NodeId>) -> Vec<NodeId> {
    for id in &ids {
        graph.mark_node_dirty(id);
        trace!(node_id = %id, "marked dirty");
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::registry::NodeTypeRegistry;
    use std::collections::BTreeMap;

    // Chain: a feeds b feeds c, with d off to the side.
    fn chain() -> (Graph, NodeId, NodeId, NodeId, NodeId) {
        let registry = NodeTypeRegistry::with_builtins();
        let mut graph = Graph::new(registry);
        let a = graph.add_node("solid::box", BTreeMap::new()).unwrap();
        let b = graph.add_node("xform::translate", BTreeMap::new()).unwrap();
        let c = graph.add_node("analysis::bounding_box", BTreeMap::new()).unwrap();
        let d = graph.add_node("solid::sphere", BTreeMap::new()).unwrap();
        graph.bind(&a, "shape", &b, "shape").unwrap();
        graph.bind(&b, "shape", &c, "shape").unwrap();
        (graph, a, b, c, d)
    }

    #[test]
    fn closure_follows_bindings_downstream_only() {
        let (graph, a, b, c, d) = chain();
        let closure = downstream_closure(&graph, &[b.as_str()]);
        assert_eq!(closure, vec![b.clone(), c.clone()]);

        let from_a = downstream_closure(&graph, &[a.as_str()]);
        assert_eq!(from_a, vec![a, b, c]);
        assert!(!from_a.contains(&d));
    }

    #[test]
    fn closure_ignores_unknown_roots() {
        let (graph, ..) = chain();
        assert!(downstream_closure(&graph, &["missing"]).is_empty());
    }

    #[test]
    fn marking_sets_the_dirty_flag() {
        let (mut graph, a, b, c, _) = chain();
        // Settle everything first so only the marked set is dirty.
        for id in graph.node_ids() {
            let outputs = BTreeMap::new();
            let result = std::sync::Arc::new(crate::graph::node::NodeResult::new(outputs));
            graph.adopt_result(&id, result).unwrap();
        }
        assert!(graph.dirty_nodes().is_empty());

        let marked = mark_downstream(&mut graph, &[b.as_str()]);
        assert_eq!(marked, vec![b.clone(), c.clone()]);
        assert_eq!(graph.dirty_nodes(), vec![b, c]);
        assert!(!graph.node(&a).unwrap().dirty());
    }
}
