use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Transport};
use crate::errors::{HarnessError, HarnessErrorExt, HarnessResult};

#[derive(Debug, Clone)]
enum MockReply {
    Result(Value),
    NodeError(JsonRpcError),
    Failure(String),
}

/// Scripted in-memory transport.
///
/// Replies are queued per method and consumed in order; every request is
/// recorded so tests can count calls.
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<String, VecDeque<MockReply>>>,
    calls: Mutex<Vec<JsonRpcRequest>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_result(&self, method: &str, result: Value) {
        self.push(method, MockReply::Result(result)).await;
    }

    pub async fn push_node_error(&self, method: &str, code: i64, message: &str) {
        let error = JsonRpcError { code, message: message.to_string(), data: None };
        self.push(method, MockReply::NodeError(error)).await;
    }

    /// Queues a transport-level failure for `method`.
    pub async fn push_failure(&self, method: &str, reason: &str) {
        self.push(method, MockReply::Failure(reason.to_string())).await;
    }

    async fn push(&self, method: &str, reply: MockReply) {
        self.replies.lock().await.entry(method.to_string()).or_default().push_back(reply);
    }

    pub async fn calls(&self) -> Vec<JsonRpcRequest> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, method: &str) -> usize {
        self.calls.lock().await.iter().filter(|c| c.method == method).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &JsonRpcRequest) -> HarnessResult<JsonRpcResponse> {
        self.calls.lock().await.push(request.clone());
        let reply = self.replies.lock().await.get_mut(&request.method).and_then(VecDeque::pop_front);
        let result = match reply {
            Some(MockReply::Result(value)) => Ok(JsonRpcResponse::success(request.id, value)),
            Some(MockReply::NodeError(error)) => Ok(JsonRpcResponse::failure(request.id, error)),
            Some(MockReply::Failure(reason)) => Err(harness_error!(HarnessError::Connection, "{}", reason)),
            None => Err(harness_error!(
                HarnessError::Connection,
                "no scripted reply for {}",
                request.method
            )),
        };
        result.with_rpc_context("mock://", &request.method, Some(request.display_params()))
    }

    fn endpoint(&self) -> &str {
        "mock://"
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
