//! JSON-RPC record shapes and error codes for the stdio channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Unknown method.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;

/// Malformed or rejected parameters.
pub const CODE_INVALID_PARAMS: i64 = -32602;

/// A request read from stdin.
///
/// `id` is the sole correlation key; responses may arrive in any order.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// The error half of a response.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: CODE_METHOD_NOT_FOUND,
            message: format!("unknown method: {method}"),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self { code: CODE_INVALID_PARAMS, message: message.into() }
    }
}

impl From<EngineError> for RpcError {
    fn from(error: EngineError) -> Self {
        Self { code: error.kind.rpc_code(), message: error.message }
    }
}

/// Serializes a success response line (without the trailing newline).
#[must_use]
pub fn response_ok(id: i64, result: Value) -> String {
    serde_json::json!({ "id": id, "result": result }).to_string()
}

/// Serializes an error response line.
#[must_use]
pub fn response_err(id: i64, error: &RpcError) -> String {
    serde_json::json!({ "id": id, "error": { "code": error.code, "message": error.message } })
        .to_string()
}

/// Serializes an engine-initiated event line.
#[must_use]
pub fn event_line(event: &str, data: Value) -> String {
    serde_json::json!({ "event": event, "data": data }).to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_request_parses_with_and_without_params() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"id":1,"method":"get_all_downloads"}"#).unwrap();
        assert_eq!(req.id, 1);
        assert_eq!(req.method, "get_all_downloads");
        assert!(req.params.is_null());

        let req: RpcRequest =
            serde_json::from_str(r#"{"id":2,"method":"pause_download","params":{"gid":"x"}}"#)
                .unwrap();
        assert_eq!(req.params["gid"], "x");
    }

    #[test]
    fn test_response_shapes() {
        let ok = response_ok(7, serde_json::json!({"gid": "abc"}));
        let value: Value = serde_json::from_str(&ok).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["result"]["gid"], "abc");
        assert!(value.get("error").is_none());

        let err = response_err(8, &RpcError::method_not_found("frobnicate"));
        let value: Value = serde_json::from_str(&err).unwrap();
        assert_eq!(value["id"], 8);
        assert_eq!(value["error"]["code"], CODE_METHOD_NOT_FOUND);
        assert!(value["error"]["message"].as_str().unwrap().contains("frobnicate"));
    }

    #[test]
    fn test_engine_error_maps_to_application_code() {
        let rpc: RpcError = EngineError::fatal(ErrorKind::HashMismatch, "bad piece").into();
        assert_eq!(rpc.code, ErrorKind::HashMismatch.rpc_code());
        assert_eq!(rpc.message, "bad piece");
    }

    #[test]
    fn test_event_line_shape() {
        let line = event_line("download:added", serde_json::json!({"gid": "1"}));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "download:added");
        assert_eq!(value["data"]["gid"], "1");
        assert!(value.get("id").is_none());
    }
}
