//! Deterministic dependency resolution.
//!
//! Evaluation plans come from a depth-first walk over incoming bindings,
//! restricted to the transitive upstream closure of the requested roots.
//! The walk visits upstream nodes in registration-sequence order, which
//! makes the emitted topological order a pure function of the graph and the
//! root set. A cycle is reported only when the walk actually runs into it;
//! cyclic regions outside the closure never abort an evaluation.

use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::graph::graph::Graph;
use crate::graph::node::NodeId;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    InProgress,
    Finished,
}

enum Frame {
    Enter(NodeId),
    Exit(NodeId),
}

/// Topological evaluation order for the upstream closure of `roots`.
/// Dependencies always precede dependents; ties fall back to registration
/// sequence. Fails with `CyclicGraph` naming the nodes on the cycle path.
pub fn upstream_order(graph: &Graph, roots: &[&str]) -> EngineResult<Vec<NodeId>> {
    let mut ordered_roots: Vec<&str> = Vec::with_capacity(roots.len());
    for root in roots {
        if !graph.contains(root) {
            return Err(EngineError::node_not_found(*root));
        }
        ordered_roots.push(root);
    }
    ordered_roots.sort_by_key(|id| graph.node(id).map(|node| node.seq()));
    ordered_roots.dedup();

    let mut marks: HashMap<NodeId, Mark> = HashMap::new();
    let mut order: Vec<NodeId> = Vec::new();
    let mut path: Vec<NodeId> = Vec::new();

    for root in ordered_roots {
        if marks.contains_key(root) {
            continue;
        }
        let mut stack = vec![Frame::Enter(root.to_string())];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id) => match marks.get(&id) {
                    Some(Mark::Finished) => {}
                    Some(Mark::InProgress) => {
                        return Err(cycle_error(&path, &id));
                    }
                    None => {
                        marks.insert(id.clone(), Mark::InProgress);
                        path.push(id.clone());
                        stack.push(Frame::Exit(id.clone()));
                        // Upstreams arrive sorted by sequence; pushing in
                        // reverse makes the stack pop them in that order.
                        for upstream in graph.upstream_of(&id).into_iter().rev() {
                            stack.push(Frame::Enter(upstream));
                        }
                    }
                },
                Frame::Exit(id) => {
                    marks.insert(id.clone(), Mark::Finished);
                    path.pop();
                    order.push(id);
                }
            }
        }
    }
    Ok(order)
}

fn cycle_error(path: &[NodeId], repeat: &str) -> EngineError {
    let start = path
        .iter()
        .position(|id| id == repeat)
        .unwrap_or(0);
    EngineError::CyclicGraph {
        nodes: path[start..].to_vec(),
    }
}
