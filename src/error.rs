//! Error taxonomy for the engine.
//!
//! `EngineError` covers faults of the graph/session level: malformed edits,
//! unresolvable documents, configuration problems, and the one structural
//! fault that aborts a run (a cycle). `EvalError` covers faults of a single
//! node evaluation: these never abort a run, they mark one node `Failed`
//! (or `Skipped` for cancellation) and cascade as skips downstream.

use std::time::Duration;

use thiserror::Error;

/// Result alias for graph and session operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Faults raised by graph edits, document handling, and run setup.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested evaluation closure contains a dependency cycle.
    /// This is the only error that aborts an evaluation run outright.
    #[error("dependency cycle involving nodes: {}", nodes.join(", "))]
    CyclicGraph { nodes: Vec<String> },

    /// A referenced node id does not exist in the graph.
    #[error("node not found: {id}")]
    NodeNotFound { id: String },

    /// A referenced socket does not exist on the node type.
    #[error("node type '{type_id}' has no {kind} socket '{socket}'")]
    SocketNotFound {
        type_id: String,
        kind: SocketKind,
        socket: String,
    },

    /// A document or edit referenced a node type the registry does not know.
    #[error("node type not registered: {type_id}")]
    TypeNotRegistered { type_id: String },

    /// A binding would connect semantically incompatible sockets.
    ///
    /// The source node id field is named `source_id` rather than `source`
    /// because thiserror reserves `source`-named fields for error chaining.
    #[error(
        "cannot bind {source_id}.{source_socket} ({source_type}) to {target}.{target_socket} ({target_type})"
    )]
    TypeMismatch {
        source_id: String,
        source_socket: String,
        source_type: String,
        target: String,
        target_socket: String,
        target_type: String,
    },

    /// An explicit node id collides with an existing node.
    #[error("node already exists: {id}")]
    DuplicateNode { id: String },

    /// Engine configuration failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A document could not be read, written, or parsed.
    #[error("document error: {message}")]
    Document {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Which side of a node a socket lives on. Used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Input,
    Output,
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketKind::Input => write!(f, "input"),
            SocketKind::Output => write!(f, "output"),
        }
    }
}

impl EngineError {
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NodeNotFound { id: id.into() }
    }

    pub fn type_not_registered(type_id: impl Into<String>) -> Self {
        Self::TypeNotRegistered {
            type_id: type_id.into(),
        }
    }

    pub fn socket_not_found(
        type_id: impl Into<String>,
        kind: SocketKind,
        socket: impl Into<String>,
    ) -> Self {
        Self::SocketNotFound {
            type_id: type_id.into(),
            kind,
            socket: socket.into(),
        }
    }

    pub fn duplicate_node(id: impl Into<String>) -> Self {
        Self::DuplicateNode { id: id.into() }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn document(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Document {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn document_msg(message: impl Into<String>) -> Self {
        Self::Document {
            message: message.into(),
            source: None,
        }
    }

    /// Stable category label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::CyclicGraph { .. } => "cycle",
            Self::NodeNotFound { .. } => "not_found",
            Self::SocketNotFound { .. } => "socket",
            Self::TypeNotRegistered { .. } => "type",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::DuplicateNode { .. } => "duplicate",
            Self::InvalidConfig { .. } => "config",
            Self::Document { .. } => "document",
        }
    }
}

/// Faults scoped to one node evaluation within a run.
///
/// Cloneable so outcomes can carry the error while the report stays cheap to
/// copy around.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// A required input socket has no binding or no upstream value.
    #[error("required input '{socket}' has no value")]
    MissingInput { socket: String },

    /// A parameter failed schema validation before dispatch.
    #[error("invalid parameter '{param}': {reason}")]
    Validation { param: String, reason: String },

    /// The kernel worker reported an operation failure.
    #[error("kernel error: {message}")]
    Kernel {
        code: Option<String>,
        message: String,
    },

    /// No reply arrived within the request deadline.
    #[error("kernel request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The kernel worker terminated while the request was outstanding.
    #[error("kernel worker crashed")]
    WorkerCrashed,

    /// The run was cancelled while this node was pending or in flight.
    #[error("evaluation cancelled")]
    Cancelled,
}

impl EvalError {
    pub fn missing_input(socket: impl Into<String>) -> Self {
        Self::MissingInput {
            socket: socket.into(),
        }
    }

    pub fn validation(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            param: param.into(),
            reason: reason.into(),
        }
    }

    pub fn kernel(message: impl Into<String>) -> Self {
        Self::Kernel {
            code: None,
            message: message.into(),
        }
    }

    pub fn kernel_coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kernel {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// A node evaluation violated the evaluation contract, e.g. issuing a
    /// second kernel request from one context.
    pub fn contract(message: impl Into<String>) -> Self {
        Self::Kernel {
            code: Some("contract".into()),
            message: message.into(),
        }
    }

    /// True for faults raised locally before or instead of a kernel round
    /// trip. Local faults never consume kernel capacity.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::MissingInput { .. } | Self::Validation { .. } | Self::Cancelled
        )
    }

    /// True when retrying the same node later could plausibly succeed
    /// without any graph edit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::WorkerCrashed | Self::Cancelled
        )
    }

    /// Stable category label for logs and events.
    pub fn category(&self) -> &'static str {
        match self {
            Self::MissingInput { .. } => "missing_input",
            Self::Validation { .. } => "validation",
            Self::Kernel { .. } => "kernel",
            Self::Timeout { .. } => "timeout",
            Self::WorkerCrashed => "worker_crashed",
            Self::Cancelled => "cancelled",
        }
    }
}
