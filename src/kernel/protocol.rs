//! Wire types exchanged with a kernel worker.
//!
//! The session is a single duplex stream of JSON messages. Requests and
//! replies pair up through `correlationId`; replies may arrive in any order
//! because the worker multiplexes operations internally.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Monotonic request identifier, unique per bridge for its lifetime.
pub type CorrelationId = u64;

/// One kernel operation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelRequest {
    pub correlation_id: CorrelationId,
    pub operation_name: String,
    pub operation_params: Value,
}

impl KernelRequest {
    pub fn new(
        correlation_id: CorrelationId,
        operation_name: impl Into<String>,
        operation_params: Value,
    ) -> Self {
        Self {
            correlation_id,
            operation_name: operation_name.into(),
            operation_params,
        }
    }
}

/// One kernel reply, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelResponse {
    pub correlation_id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<KernelFault>,
}

impl KernelResponse {
    pub fn ok(correlation_id: CorrelationId, result: Value) -> Self {
        Self {
            correlation_id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn fail(correlation_id: CorrelationId, fault: KernelFault) -> Self {
        Self {
            correlation_id,
            success: false,
            result: None,
            error: Some(fault),
        }
    }
}

/// Error payload reported by the kernel for a failed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelFault {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl KernelFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case_keys() {
        let request = KernelRequest::new(7, "solid::box", json!({"width": 2.0}));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({
                "correlationId": 7,
                "operationName": "solid::box",
                "operationParams": {"width": 2.0}
            })
        );
    }

    #[test]
    fn response_round_trips_both_shapes() {
        let ok = KernelResponse::ok(3, json!({"shape": {"kind": "box"}}));
        let back: KernelResponse = serde_json::from_str(&serde_json::to_string(&ok).unwrap()).unwrap();
        assert_eq!(back, ok);

        let fail = KernelResponse::fail(4, KernelFault::coded("degenerate", "zero-volume solid"));
        let wire = serde_json::to_value(&fail).unwrap();
        assert_eq!(wire["success"], json!(false));
        assert_eq!(wire["error"]["code"], json!("degenerate"));
        assert!(wire.get("result").is_none());
    }
}
