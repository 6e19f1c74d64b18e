//! Node type definitions and the evaluation trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::catalog::schema::{ParamSpec, SocketSpec};
use crate::error::EvalError;
use crate::kernel::bridge::KernelCtx;

/// Upstream values resolved for one node evaluation, keyed by input socket
/// name. Unbound optional sockets are simply absent.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    values: BTreeMap<String, Value>,
}

impl ResolvedInputs {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, socket: &str) -> Option<&Value> {
        self.values.get(socket)
    }

    /// Fetch a socket that must be present, failing with `MissingInput`.
    pub fn require(&self, socket: &str) -> Result<&Value, EvalError> {
        self.values
            .get(socket)
            .ok_or_else(|| EvalError::missing_input(socket))
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Behavior of a node type.
///
/// Implementations receive validated parameters and resolved inputs and
/// produce the node's socket outputs. At most one kernel request may be
/// issued through `ctx`; most types are a thin delegation to one kernel
/// operation, and purely local types never touch `ctx` at all.
#[async_trait]
pub trait NodeEval: Send + Sync {
    async fn evaluate(
        &self,
        ctx: &KernelCtx,
        inputs: &ResolvedInputs,
        params: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, EvalError>;
}

/// Schema and behavior of one registered node type.
pub struct NodeType {
    id: String,
    inputs: Vec<SocketSpec>,
    outputs: Vec<SocketSpec>,
    params: Vec<ParamSpec>,
    cacheable: bool,
    eval: Arc<dyn NodeEval>,
}

impl NodeType {
    pub fn new(id: impl Into<String>, eval: impl NodeEval + 'static) -> Self {
        Self {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: Vec::new(),
            cacheable: true,
            eval: Arc::new(eval),
        }
    }

    pub fn with_input(mut self, socket: SocketSpec) -> Self {
        self.inputs.push(socket);
        self
    }

    pub fn with_output(mut self, socket: SocketSpec) -> Self {
        self.outputs.push(socket);
        self
    }

    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Mark results of this type as non-memoizable. Every evaluation runs
    /// fresh; nothing is looked up or stored for it.
    pub fn cache_exempt(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn inputs(&self) -> &[SocketSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SocketSpec] {
        &self.outputs
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn eval(&self) -> Arc<dyn NodeEval> {
        self.eval.clone()
    }

    pub fn input(&self, name: &str) -> Option<&SocketSpec> {
        self.inputs.iter().find(|socket| socket.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&SocketSpec> {
        self.outputs.iter().find(|socket| socket.name == name)
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|param| param.name == name)
    }

    /// Parameter bag seeded with every declared default.
    pub fn default_params(&self) -> BTreeMap<String, Value> {
        self.params
            .iter()
            .map(|param| (param.name.clone(), param.default.clone()))
            .collect()
    }
}

impl std::fmt::Debug for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeType")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("params", &self.params)
            .field("cacheable", &self.cacheable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::SemanticType;
    use serde_json::json;

    struct Nop;

    #[async_trait]
    impl NodeEval for Nop {
        async fn evaluate(
            &self,
            _ctx: &KernelCtx,
            _inputs: &ResolvedInputs,
            _params: &BTreeMap<String, Value>,
        ) -> Result<BTreeMap<String, Value>, EvalError> {
            Ok(BTreeMap::new())
        }
    }

    #[test]
    fn defaults_cover_every_declared_param() {
        let ty = NodeType::new("test::thing", Nop)
            .with_param(ParamSpec::number("width", 2.0))
            .with_param(ParamSpec::text("label", "a"));
        let defaults = ty.default_params();
        assert_eq!(defaults["width"], json!(2.0));
        assert_eq!(defaults["label"], json!("a"));
        assert!(ty.cacheable());
    }

    #[test]
    fn socket_lookup_distinguishes_sides() {
        let ty = NodeType::new("test::thing", Nop)
            .with_input(SocketSpec::required("shape", SemanticType::Geometry))
            .with_output(SocketSpec::output("shape", SemanticType::Geometry));
        assert!(ty.input("shape").is_some());
        assert!(ty.output("shape").is_some());
        assert!(ty.input("missing").is_none());
    }

    #[test]
    fn missing_required_input_is_reported_by_name() {
        let inputs = ResolvedInputs::default();
        match inputs.require("a") {
            Err(EvalError::MissingInput { socket }) => assert_eq!(socket, "a"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
