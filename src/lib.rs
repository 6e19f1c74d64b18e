// Shared infrastructure
pub mod cancel;
pub mod config;
pub mod error;

// Graph model and the node type catalog
pub mod catalog;
pub mod graph;

// Kernel sessions and the evaluation engine
pub mod engine;
pub mod kernel;

// Re-exports for convenience
pub use cancel::CancelSignal;
pub use catalog::{
    NodeEval, NodeType, NodeTypeRegistry, ParamSpec, ResolvedInputs, SemanticType, SocketSpec,
};
pub use config::{EngineConfig, EvalOptions};
pub use engine::{
    CacheStats, EngineEvent, EvaluationReport, Evaluator, NodeOutcome, RunStats, SkipReason,
};
pub use error::{EngineError, EngineResult, EvalError};
pub use graph::{Edge, Graph, GraphDoc, Node, NodeId, NodeResult};
pub use kernel::{
    BridgeStats, InProcessWorkerFactory, KernelBridge, KernelCtx, KernelFault, KernelService,
    StubKernel,
};
