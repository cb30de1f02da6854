use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use reqwest::Client;

use super::{JsonRpcRequest, JsonRpcResponse, Transport};
use crate::errors::{HarnessError, HarnessErrorExt, HarnessResult};

/// Stateless HTTP transport: every request is a separate POST.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: Client::new(), url: url.into() }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &JsonRpcRequest) -> HarnessResult<JsonRpcResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| Report::new(e).change_context(HarnessError::Connection))
            .with_rpc_context(&self.url, &request.method, Some(request.display_params()))?;

        let status = response.status();
        response
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| Report::new(e).change_context(HarnessError::InvalidResponse))
            .attach_printable_lazy(|| format!("http status {}", status))
            .with_rpc_context(&self.url, &request.method, Some(request.display_params()))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_connection_error() {
        // nothing listens on the discard port
        let transport = HttpTransport::new("http://127.0.0.1:9");
        let err = transport
            .send(&JsonRpcRequest::new("eth_chainId", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.current_context(), &HarnessError::Connection);
        let context = err.downcast_ref::<crate::errors::RpcContext>().unwrap();
        assert_eq!(context.method, "eth_chainId");
        assert_eq!(context.endpoint, "http://127.0.0.1:9");
    }
}
