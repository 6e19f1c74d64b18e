//! Node type catalog: socket/parameter schemas, the evaluation trait, the
//! registry, and the builtin types.

pub mod builtin;
pub mod registry;
pub mod schema;
pub mod types;

pub use registry::{NodeTypeRegistry, NODE_TYPES};
pub use schema::{ParamSpec, SemanticType, SocketSpec};
pub use types::{NodeEval, NodeType, ResolvedInputs};
