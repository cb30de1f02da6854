//! Ethereum JSON-RPC client used by the suites.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use error_stack::{Report, ResultExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::errors::{HarnessError, HarnessResult};
use crate::logging::LogCtx;
use crate::rpc::{HttpTransport, JsonRpcRequest, JsonRpcResponse, Transport, WsTransport};

/// Block selector accepted by the state queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockTag {
    Earliest,
    #[default]
    Latest,
    Pending,
    Number(u64),
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTag::Earliest => write!(f, "earliest"),
            BlockTag::Latest => write!(f, "latest"),
            BlockTag::Pending => write!(f, "pending"),
            BlockTag::Number(n) => write!(f, "{:#x}", n),
        }
    }
}

impl BlockTag {
    fn to_param(self) -> Value {
        Value::String(self.to_string())
    }
}

#[derive(Clone)]
pub struct EthRpc {
    transport: Arc<dyn Transport>,
    ctx: LogCtx,
}

impl fmt::Debug for EthRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EthRpc").field("endpoint", &self.transport.endpoint()).finish()
    }
}

impl EthRpc {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, ctx: LogCtx::empty() }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self::new(Arc::new(HttpTransport::new(url)))
    }

    pub async fn ws(url: impl Into<String>) -> HarnessResult<Self> {
        Ok(Self::new(Arc::new(WsTransport::connect(url).await?)))
    }

    pub fn with_logger(mut self, ctx: &LogCtx) -> Self {
        self.ctx = ctx.clone();
        self
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Sends a raw `{jsonrpc, id: 1, method, params}` envelope and hands back
    /// the whole response, `error` member included.
    pub async fn custom_request(&self, method: &str, params: Vec<Value>) -> HarnessResult<JsonRpcResponse> {
        let request = JsonRpcRequest::new(method, params);
        let params = request.display_params();
        self.ctx.try_log(|logger| debug!(logger, " <== custom request {} ({})", method, params));

        let response = self.transport.send(&request).await.map_err(|report| {
            let reason = report.to_string();
            report.attach_printable(format!(
                "Failed to send custom request ({} ({})): {}",
                method, params, reason
            ))
        })?;

        self.ctx.try_log(|logger| {
            let rendered = serde_json::to_string(&response).unwrap_or_default();
            debug!(logger, " ==> custom response {}", rendered)
        });
        Ok(response)
    }

    /// Like [`EthRpc::custom_request`], but decodes `result` and turns a node
    /// `error` member into an [`HarnessError::Rpc`] report.
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> HarnessResult<T> {
        let result = self.custom_request(method, params).await?.into_result()?;
        serde_json::from_value(result)
            .map_err(|e| Report::new(e).change_context(HarnessError::InvalidResponse))
            .attach_printable_lazy(|| format!("unable to decode {} result", method))
    }

    pub async fn chain_id(&self) -> HarnessResult<u64> {
        let quantity: U256 = self.request("eth_chainId", vec![]).await?;
        to_u64(quantity, "eth_chainId")
    }

    pub async fn block_number(&self) -> HarnessResult<u64> {
        let quantity: U256 = self.request("eth_blockNumber", vec![]).await?;
        to_u64(quantity, "eth_blockNumber")
    }

    pub async fn balance(&self, address: &Address, tag: BlockTag) -> HarnessResult<U256> {
        self.request("eth_getBalance", vec![json!(address), tag.to_param()]).await
    }

    pub async fn transaction_count(&self, address: &Address, tag: BlockTag) -> HarnessResult<u64> {
        let quantity: U256 =
            self.request("eth_getTransactionCount", vec![json!(address), tag.to_param()]).await?;
        to_u64(quantity, "eth_getTransactionCount")
    }

    pub async fn send_raw_transaction(&self, raw: &Bytes) -> HarnessResult<B256> {
        self.request("eth_sendRawTransaction", vec![json!(raw)]).await
    }

    pub async fn block_by_number(&self, tag: BlockTag, full_transactions: bool) -> HarnessResult<Option<Value>> {
        self.request("eth_getBlockByNumber", vec![tag.to_param(), json!(full_transactions)]).await
    }

    pub async fn transaction_receipt(&self, hash: &B256) -> HarnessResult<Option<Value>> {
        self.request("eth_getTransactionReceipt", vec![json!(hash)]).await
    }

    /// Closes the underlying connection. No-op over HTTP.
    pub async fn disconnect(&self) {
        self.transport.close().await;
    }
}

fn to_u64(quantity: U256, method: &str) -> HarnessResult<u64> {
    u64::try_from(quantity).map_err(|_| {
        harness_error!(HarnessError::InvalidResponse, "{} returned {} which overflows u64", method, quantity)
    })
}
