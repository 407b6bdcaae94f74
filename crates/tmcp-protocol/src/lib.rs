//! Wire format for the stdio transport.
//!
//! Each frame is exactly one JSON object followed by `\n`: a *request*
//! `{ "jsonrpc": "2.0", "id": …, "method": …, "params": … }` or a
//! *response* `{ "jsonrpc": "2.0", "id": …, "result" | "error": … }`.
//! Recognised methods: `tools/call`, `resources/list`, `resources/read`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod server;
pub mod stream;

pub use server::StdioServer;
pub use stream::StreamParser;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tmcp_error::{CorrelationId, TaskError, TaskErrorDto};

/// The JSON-RPC version tag carried on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// `tools/call` method name.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// `resources/list` method name.
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
/// `resources/read` method name.
pub const METHOD_RESOURCES_READ: &str = "resources/read";

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// An incoming request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Caller-chosen identifier echoed on the response.
    #[serde(default)]
    pub id: Value,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// An outgoing response frame: exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Echo of the request's id (`null` when it could not be parsed).
    pub id: Value,
    /// Success payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// A successful response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// JSON-RPC error code (`-32700`…`-32000`).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Structured detail; domain errors carry their [`TaskErrorDto`] here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// `-32700` — the frame was not valid JSON.
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self {
            code: -32700,
            message: format!("parse error: {detail}"),
            data: None,
        }
    }

    /// `-32600` — the frame was JSON but not a valid request.
    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self {
            code: -32600,
            message: format!("invalid request: {detail}"),
            data: None,
        }
    }

    /// Map a domain error (plus the request's correlation ID) onto the
    /// JSON-RPC surface.
    pub fn from_task_error(err: &TaskError, correlation_id: &CorrelationId) -> Self {
        Self {
            code: err.code.jsonrpc_code(),
            message: err.message.clone(),
            data: serde_json::to_value(TaskErrorDto::from_error(err, correlation_id)).ok(),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors arising from JSONL encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization or deserialization failure.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame-level invariant was violated (e.g. oversized line).
    #[error("protocol violation: {0}")]
    Violation(String),
}

/// Newline-delimited JSON codec for frames.
#[derive(Debug, Clone, Copy)]
pub struct JsonlCodec;

impl JsonlCodec {
    /// Serialize a frame as one newline-terminated JSON line.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Json`] if serialization fails.
    pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line into a frame.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Json`] if the line is not valid JSON of the expected
    /// shape.
    pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tmcp_error::ErrorCode;

    #[test]
    fn request_roundtrip() {
        let line = r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"change.list","arguments":{}}}"#;
        let req: Request = JsonlCodec::decode(line).unwrap();
        assert_eq!(req.jsonrpc, "2.0");
        assert_eq!(req.id, json!(1));
        assert_eq!(req.method, METHOD_TOOLS_CALL);
        assert_eq!(req.params["name"], "change.list");

        let encoded = JsonlCodec::encode(&req).unwrap();
        assert!(encoded.ends_with('\n'));
        let back: Request = JsonlCodec::decode(&encoded).unwrap();
        assert_eq!(back.method, req.method);
    }

    #[test]
    fn missing_id_defaults_to_null() {
        let req: Request =
            JsonlCodec::decode(r#"{"jsonrpc":"2.0","method":"resources/list"}"#).unwrap();
        assert!(req.id.is_null());
        assert!(req.params.is_null());
    }

    #[test]
    fn success_response_omits_error() {
        let resp = Response::success(json!("a"), json!({"ok": true}));
        let line = JsonlCodec::encode(&resp).unwrap();
        assert!(line.contains(r#""result""#));
        assert!(!line.contains(r#""error""#));
    }

    #[test]
    fn failure_response_omits_result() {
        let resp = Response::failure(json!(2), RpcError::parse_error("bad"));
        let line = JsonlCodec::encode(&resp).unwrap();
        assert!(line.contains(r#""error""#));
        assert!(!line.contains(r#""result""#));
        assert!(line.contains("-32700"));
    }

    #[test]
    fn domain_error_carries_taxonomy_in_data() {
        let cid = CorrelationId::generate();
        let err = TaskError::new(ErrorCode::Locked, "held").with_hint("wait");
        let rpc = RpcError::from_task_error(&err, &cid);
        assert_eq!(rpc.code, -32000);
        let data = rpc.data.unwrap();
        assert_eq!(data["code"], "ELOCKED");
        assert_eq!(data["hint"], "wait");
        assert_eq!(data["correlationId"], cid.as_str());
        assert_eq!(data["retryable"], true);
    }

    #[test]
    fn validation_errors_map_to_invalid_params() {
        let cid = CorrelationId::generate();
        let err = TaskError::new(ErrorCode::BadSlug, "bad slug");
        assert_eq!(RpcError::from_task_error(&err, &cid).code, -32602);
        let err = TaskError::new(ErrorCode::MethodNotFound, "nope");
        assert_eq!(RpcError::from_task_error(&err, &cid).code, -32601);
    }
}
