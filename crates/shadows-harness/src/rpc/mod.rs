//! JSON-RPC envelopes and the transports carrying them.

pub mod http;
pub mod mock;
pub mod ws;

use async_trait::async_trait;
use error_stack::Report;
use serde_json::Value;

use crate::errors::{HarnessError, HarnessResult};

pub use http::HttpTransport;
pub use mock::MockTransport;
pub use ws::WsTransport;

/// A connection able to exchange JSON-RPC envelopes with the node.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request and waits for the matching response envelope.
    ///
    /// A node-side `error` member is part of a successful exchange; only
    /// transport failures are reported as errors.
    async fn send(&self, request: &JsonRpcRequest) -> HarnessResult<JsonRpcResponse>;

    fn endpoint(&self) -> &str;

    /// Releases the underlying connection. Calling it again is a no-op.
    async fn close(&self) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self { jsonrpc: "2.0", id: 1, method: method.into(), params }
    }

    /// Params rendered the way they appear in request logs: `a,b,c`.
    pub fn display_params(&self) -> String {
        display_params(&self.params)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self { id: Some(id), jsonrpc: "2.0".to_string(), result: Some(result), error: None }
    }

    pub fn failure(id: u64, error: JsonRpcError) -> Self {
        Self { id: Some(id), jsonrpc: "2.0".to_string(), result: None, error: Some(error) }
    }

    /// The `result` member, or the node error. A missing result reads as `null`.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Error object returned by the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("error (code {code}): {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<JsonRpcError> for Report<HarnessError> {
    fn from(err: JsonRpcError) -> Self {
        Report::new(err).change_context(HarnessError::Rpc)
    }
}

pub fn display_params(params: &[Value]) -> String {
    params
        .iter()
        .map(|param| match param {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}
