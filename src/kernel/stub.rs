//! In-process stand-in for the geometry kernel.
//!
//! Real deployments put a CAD kernel behind the worker seam. The stub
//! answers the builtin catalog's operations with analytic placeholder
//! geometry (shape descriptors and exact bounding boxes), which is enough
//! for demos and for exercising the full dispatch path in tests.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::kernel::protocol::KernelFault;
use crate::kernel::worker::KernelService;

/// Analytic kernel double. Stateless; cheap to share across workers.
#[derive(Debug, Default)]
pub struct StubKernel {
    latency: Option<Duration>,
}

impl StubKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering each operation. Useful for demos
    /// that want visible progress and tests that need overlap.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
        }
    }
}

#[async_trait]
impl KernelService for StubKernel {
    async fn perform(&self, operation: &str, payload: &Value) -> Result<Value, KernelFault> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let params = payload.get("params").unwrap_or(&Value::Null);
        let inputs = payload.get("inputs").unwrap_or(&Value::Null);
        match operation {
            "solid::box" => {
                let size = [num(params, "width")?, num(params, "depth")?, num(params, "height")?];
                Ok(json!({"shape": {"kind": "box", "size": size}}))
            }
            "solid::sphere" => {
                let radius = num(params, "radius")?;
                Ok(json!({"shape": {"kind": "sphere", "radius": radius}}))
            }
            "solid::cylinder" => {
                let radius = num(params, "radius")?;
                let height = num(params, "height")?;
                Ok(json!({"shape": {"kind": "cylinder", "radius": radius, "height": height}}))
            }
            "boolean::union" | "boolean::difference" | "boolean::intersect" => {
                let a = socket(inputs, "a")?;
                let b = socket(inputs, "b")?;
                let op = operation.trim_start_matches("boolean::");
                Ok(json!({"shape": {"kind": "boolean", "op": op, "operands": [a, b]}}))
            }
            "xform::translate" => {
                let shape = socket(inputs, "shape")?;
                let offset = vec3(params, "offset")?;
                Ok(json!({"shape": {"kind": "translate", "offset": offset, "child": shape}}))
            }
            "analysis::bounding_box" => {
                let shape = socket(inputs, "shape")?;
                let shape = shape.get("shape").unwrap_or(shape);
                let (min, max) = bounds(shape)?;
                let size = [max[0] - min[0], max[1] - min[1], max[2] - min[2]];
                Ok(json!({"min": min, "max": max, "size": size}))
            }
            "value::random" => {
                let lo = num(params, "min")?;
                let hi = num(params, "max")?;
                if hi < lo {
                    return Err(KernelFault::coded("bad_request", "min exceeds max"));
                }
                let value = lo + fastrand::f64() * (hi - lo);
                Ok(json!({"value": value}))
            }
            other => Err(KernelFault::coded(
                "unknown_op",
                format!("kernel does not implement '{other}'"),
            )),
        }
    }
}

fn num(params: &Value, key: &str) -> Result<f64, KernelFault> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| KernelFault::coded("bad_request", format!("missing numeric param '{key}'")))
}

fn vec3(params: &Value, key: &str) -> Result<[f64; 3], KernelFault> {
    let items = params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| KernelFault::coded("bad_request", format!("missing vector param '{key}'")))?;
    if items.len() != 3 {
        return Err(KernelFault::coded(
            "bad_request",
            format!("param '{key}' must have three components"),
        ));
    }
    let mut out = [0.0; 3];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item.as_f64().ok_or_else(|| {
            KernelFault::coded("bad_request", format!("param '{key}' must be numeric"))
        })?;
    }
    Ok(out)
}

fn socket<'a>(inputs: &'a Value, name: &str) -> Result<&'a Value, KernelFault> {
    inputs
        .get(name)
        .ok_or_else(|| KernelFault::coded("bad_request", format!("missing input '{name}'")))
}

/// Exact axis-aligned bounds of a stub shape descriptor.
fn bounds(shape: &Value) -> Result<([f64; 3], [f64; 3]), KernelFault> {
    let kind = shape
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| KernelFault::coded("bad_request", "input is not a shape"))?;
    match kind {
        "box" => {
            let size = vec3(shape, "size")?;
            Ok(([0.0, 0.0, 0.0], size))
        }
        "sphere" => {
            let r = num(shape, "radius")?;
            Ok(([-r, -r, -r], [r, r, r]))
        }
        "cylinder" => {
            let r = num(shape, "radius")?;
            let h = num(shape, "height")?;
            Ok(([-r, -r, 0.0], [r, r, h]))
        }
        "translate" => {
            let offset = vec3(shape, "offset")?;
            let child = shape
                .get("child")
                .ok_or_else(|| KernelFault::coded("bad_request", "translate without child"))?;
            let (min, max) = bounds(child)?;
            Ok((
                [min[0] + offset[0], min[1] + offset[1], min[2] + offset[2]],
                [max[0] + offset[0], max[1] + offset[1], max[2] + offset[2]],
            ))
        }
        "boolean" => {
            let operands = shape
                .get("operands")
                .and_then(Value::as_array)
                .ok_or_else(|| KernelFault::coded("bad_request", "boolean without operands"))?;
            let op = shape.get("op").and_then(Value::as_str).unwrap_or("union");
            let mut iter = operands.iter();
            let first = iter
                .next()
                .ok_or_else(|| KernelFault::coded("bad_request", "boolean with no operands"))?;
            let (mut min, mut max) = bounds(first.get("shape").unwrap_or(first))?;
            for operand in iter {
                let (omin, omax) = bounds(operand.get("shape").unwrap_or(operand))?;
                match op {
                    // Difference keeps at most the first operand's extent.
                    "difference" => break,
                    "intersect" => {
                        for axis in 0..3 {
                            min[axis] = min[axis].max(omin[axis]);
                            max[axis] = max[axis].min(omax[axis]).max(min[axis]);
                        }
                    }
                    _ => {
                        for axis in 0..3 {
                            min[axis] = min[axis].min(omin[axis]);
                            max[axis] = max[axis].max(omax[axis]);
                        }
                    }
                }
            }
            Ok((min, max))
        }
        other => Err(KernelFault::coded(
            "bad_request",
            format!("unknown shape kind '{other}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn box_then_translate_then_bounds() {
        let kernel = StubKernel::new();
        let solid = kernel
            .perform(
                "solid::box",
                &json!({"params": {"width": 2.0, "depth": 4.0, "height": 1.0}}),
            )
            .await
            .unwrap();
        let moved = kernel
            .perform(
                "xform::translate",
                &json!({
                    "params": {"offset": [10.0, 0.0, 0.0]},
                    "inputs": {"shape": solid["shape"]}
                }),
            )
            .await
            .unwrap();
        let report = kernel
            .perform(
                "analysis::bounding_box",
                &json!({"inputs": {"shape": moved["shape"]}}),
            )
            .await
            .unwrap();
        assert_eq!(report["min"], json!([10.0, 0.0, 0.0]));
        assert_eq!(report["max"], json!([12.0, 4.0, 1.0]));
        assert_eq!(report["size"], json!([2.0, 4.0, 1.0]));
    }

    #[tokio::test]
    async fn union_bounds_cover_both_operands() {
        let kernel = StubKernel::new();
        let a = json!({"kind": "sphere", "radius": 1.0});
        let b = json!({"kind": "translate", "offset": [5.0, 0.0, 0.0], "child": {"kind": "sphere", "radius": 1.0}});
        let joined = kernel
            .perform(
                "boolean::union",
                &json!({"inputs": {"a": a, "b": b}}),
            )
            .await
            .unwrap();
        let report = kernel
            .perform(
                "analysis::bounding_box",
                &json!({"inputs": {"shape": joined["shape"]}}),
            )
            .await
            .unwrap();
        assert_eq!(report["min"], json!([-1.0, -1.0, -1.0]));
        assert_eq!(report["max"], json!([6.0, 1.0, 1.0]));
    }

    #[tokio::test]
    async fn random_respects_bounds_and_unknown_ops_fault() {
        let kernel = StubKernel::new();
        let out = kernel
            .perform("value::random", &json!({"params": {"min": 2.0, "max": 3.0}}))
            .await
            .unwrap();
        let value = out["value"].as_f64().unwrap();
        assert!((2.0..3.0).contains(&value));

        let fault = kernel.perform("solid::torus", &json!({})).await.unwrap_err();
        assert_eq!(fault.code.as_deref(), Some("unknown_op"));
    }
}
