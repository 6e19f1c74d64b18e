//! Graph model: nodes, bindings, dirty tracking, and document persistence.

pub mod document;
pub mod graph;
pub mod invalidate;
pub mod node;

pub use document::{EdgeDoc, GraphDoc, NodeDoc};
pub use graph::{Edge, Graph};
pub use invalidate::downstream_closure;
pub use node::{Node, NodeId, NodeResult};
