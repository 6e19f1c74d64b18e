//! Builtin node catalog.
//!
//! Every kernel-backed type here is schema plus a one-line delegation: the
//! operation name is the type id and the payload is the validated parameter
//! bag plus the resolved inputs. The two `value::` types show the other
//! corners of the contract: a cache-exempt source and a purely local type
//! that never touches the kernel.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::catalog::registry::{NodeTypeRegistry, NODE_TYPES};
use crate::catalog::schema::{ParamSpec, SemanticType, SocketSpec};
use crate::catalog::types::{NodeEval, NodeType, ResolvedInputs};
use crate::error::EvalError;
use crate::kernel::bridge::KernelCtx;

#[linkme::distributed_slice(NODE_TYPES)]
static REGISTER_BUILTINS: fn(&NodeTypeRegistry) = register_builtins;

/// Delegates evaluation to the kernel operation named after the node type.
struct KernelOp {
    operation: &'static str,
}

#[async_trait]
impl NodeEval for KernelOp {
    async fn evaluate(
        &self,
        ctx: &KernelCtx,
        inputs: &ResolvedInputs,
        params: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, EvalError> {
        let payload = json!({"params": params, "inputs": inputs.values()});
        let result = ctx.invoke(self.operation, payload).await?;
        outputs_from(result)
    }
}

/// Emits its `value` parameter unchanged. No kernel round trip.
struct ConstantEval;

#[async_trait]
impl NodeEval for ConstantEval {
    async fn evaluate(
        &self,
        _ctx: &KernelCtx,
        _inputs: &ResolvedInputs,
        params: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, EvalError> {
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        Ok(BTreeMap::from([("value".to_string(), value)]))
    }
}

fn outputs_from(result: Value) -> Result<BTreeMap<String, Value>, EvalError> {
    match result {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(EvalError::kernel(format!(
            "kernel returned a non-object payload: {other}"
        ))),
    }
}

fn delegate(operation: &'static str) -> NodeType {
    NodeType::new(operation, KernelOp { operation })
}

fn solid(operation: &'static str) -> NodeType {
    delegate(operation).with_output(SocketSpec::output("shape", SemanticType::Geometry))
}

fn boolean(operation: &'static str) -> NodeType {
    delegate(operation)
        .with_input(SocketSpec::required("a", SemanticType::Geometry))
        .with_input(SocketSpec::required("b", SemanticType::Geometry))
        .with_output(SocketSpec::output("shape", SemanticType::Geometry))
}

fn register_builtins(registry: &NodeTypeRegistry) {
    registry.register(
        solid("solid::box")
            .with_param(ParamSpec::number("width", 1.0).with_min(0.0))
            .with_param(ParamSpec::number("depth", 1.0).with_min(0.0))
            .with_param(ParamSpec::number("height", 1.0).with_min(0.0)),
    );
    registry.register(
        solid("solid::sphere").with_param(ParamSpec::number("radius", 1.0).with_min(0.0)),
    );
    registry.register(
        solid("solid::cylinder")
            .with_param(ParamSpec::number("radius", 1.0).with_min(0.0))
            .with_param(ParamSpec::number("height", 1.0).with_min(0.0)),
    );

    registry.register(boolean("boolean::union"));
    registry.register(boolean("boolean::difference"));
    registry.register(boolean("boolean::intersect"));

    registry.register(
        delegate("xform::translate")
            .with_input(SocketSpec::required("shape", SemanticType::Geometry))
            .with_output(SocketSpec::output("shape", SemanticType::Geometry))
            .with_param(ParamSpec::vector("offset", [0.0, 0.0, 0.0])),
    );

    registry.register(
        delegate("analysis::bounding_box")
            .with_input(SocketSpec::required("shape", SemanticType::Geometry))
            .with_output(SocketSpec::output("min", SemanticType::Vector))
            .with_output(SocketSpec::output("max", SemanticType::Vector))
            .with_output(SocketSpec::output("size", SemanticType::Vector)),
    );

    // Fresh noise on every run; memoizing it would defeat its purpose.
    registry.register(
        delegate("value::random")
            .with_param(ParamSpec::number("min", 0.0))
            .with_param(ParamSpec::number("max", 1.0))
            .with_output(SocketSpec::output("value", SemanticType::Number))
            .cache_exempt(),
    );

    registry.register(
        NodeType::new("value::constant", ConstantEval)
            .with_param(ParamSpec::any("value", Value::Null))
            .with_output(SocketSpec::output("value", SemanticType::Any)),
    );
}
