//! Typed client for the node's chain RPC surface.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::B256;
use error_stack::{Report, ResultExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::errors::{HarnessError, HarnessResult};
use crate::logging::LogCtx;
use crate::rpc::{JsonRpcRequest, Transport};
use crate::types_bundle::{TypeDefinitions, TypesBundle};

/// `state_getRuntimeVersion` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVersion {
    pub spec_name: String,
    pub impl_name: String,
    pub authoring_version: u32,
    pub spec_version: u32,
    pub impl_version: u32,
    #[serde(default)]
    pub transaction_version: u32,
}

/// Block sealed by `engine_createBlock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedBlock {
    pub hash: B256,
    #[serde(default)]
    pub aux: Value,
}

#[derive(Clone)]
pub struct ChainApi {
    transport: Arc<dyn Transport>,
    runtime: RuntimeVersion,
    registry: Option<TypeDefinitions>,
    ctx: LogCtx,
}

impl fmt::Debug for ChainApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainApi")
            .field("endpoint", &self.transport.endpoint())
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl ChainApi {
    /// Reads the runtime version and picks the matching type definitions from
    /// `bundle`, if any.
    pub async fn create(
        transport: Arc<dyn Transport>,
        bundle: Option<&TypesBundle>,
        ctx: &LogCtx,
    ) -> HarnessResult<ChainApi> {
        let runtime: RuntimeVersion = call(transport.as_ref(), "state_getRuntimeVersion", vec![]).await?;
        let registry = bundle.and_then(|b| b.select(&runtime.spec_name, runtime.spec_version));
        ctx.try_log(|logger| {
            info!(
                logger,
                "Chain API connected to {} ({} v{}, {} type overrides)",
                transport.endpoint(),
                runtime.spec_name,
                runtime.spec_version,
                registry.as_ref().map_or(0, |r| r.len())
            )
        });
        Ok(ChainApi { transport, runtime, registry, ctx: ctx.clone() })
    }

    pub fn runtime_version(&self) -> &RuntimeVersion {
        &self.runtime
    }

    /// Type definitions selected for the connected runtime.
    pub fn registry(&self) -> Option<&TypeDefinitions> {
        self.registry.as_ref()
    }

    pub fn log_ctx(&self) -> &LogCtx {
        &self.ctx
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Raw `engine_createBlock` call. Callers only look at its truthiness.
    pub async fn create_block(
        &self,
        create_empty: bool,
        finalize: bool,
        parent: Option<B256>,
    ) -> HarnessResult<Value> {
        self.call("engine_createBlock", vec![json!(create_empty), json!(finalize), json!(parent)])
            .await
    }

    /// Seals a block and decodes the returned hash.
    pub async fn seal_block(&self, finalize: bool) -> HarnessResult<CreatedBlock> {
        let created = self.create_block(true, finalize, None).await?;
        serde_json::from_value(created)
            .map_err(|e| Report::new(e).change_context(HarnessError::InvalidResponse))
            .attach_printable("unable to decode engine_createBlock result")
    }

    pub async fn finalize_block(&self, hash: &B256, justification: Option<Value>) -> HarnessResult<bool> {
        let mut params = vec![json!(hash)];
        if let Some(justification) = justification {
            params.push(justification);
        }
        self.call("engine_finalizeBlock", params).await
    }

    pub async fn header(&self, hash: Option<&B256>) -> HarnessResult<Value> {
        let params = hash.map(|h| vec![json!(h)]).unwrap_or_default();
        self.call("chain_getHeader", params).await
    }

    pub async fn finalized_head(&self) -> HarnessResult<B256> {
        self.call("chain_getFinalizedHead", vec![]).await
    }

    pub async fn block_hash(&self, number: u64) -> HarnessResult<Option<B256>> {
        self.call("chain_getBlockHash", vec![json!(number)]).await
    }

    pub async fn system_chain(&self) -> HarnessResult<String> {
        self.call("system_chain", vec![]).await
    }

    /// Names of every RPC method the node exposes.
    pub async fn rpc_methods(&self) -> HarnessResult<Vec<String>> {
        #[derive(Deserialize)]
        struct Methods {
            methods: Vec<String>,
        }
        let listed: Methods = self.call("rpc_methods", vec![]).await?;
        Ok(listed.methods)
    }

    pub async fn disconnect(&self) {
        self.transport.close().await;
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> HarnessResult<T> {
        call(self.transport.as_ref(), method, params).await
    }
}

async fn call<T: DeserializeOwned>(
    transport: &dyn Transport,
    method: &str,
    params: Vec<Value>,
) -> HarnessResult<T> {
    let result = transport.send(&JsonRpcRequest::new(method, params)).await?.into_result()?;
    serde_json::from_value(result)
        .map_err(|e| Report::new(e).change_context(HarnessError::InvalidResponse))
        .attach_printable_lazy(|| format!("unable to decode {} result", method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MockTransport;

    fn runtime_version(spec_name: &str, spec_version: u32) -> Value {
        json!({
            "specName": spec_name,
            "implName": spec_name,
            "authoringVersion": 3,
            "specVersion": spec_version,
            "implVersion": 0,
            "transactionVersion": 1
        })
    }

    async fn connected(mock: &Arc<MockTransport>, bundle: Option<&TypesBundle>) -> ChainApi {
        ChainApi::create(mock.clone(), bundle, &LogCtx::empty()).await.unwrap()
    }

    #[tokio::test]
    async fn test_registry_follows_runtime_version() {
        let mock = Arc::new(MockTransport::new());
        mock.push_result("state_getRuntimeVersion", runtime_version("node-shadows", 7)).await;
        let bundle = TypesBundle::shadows().unwrap();

        let api = connected(&mock, Some(&bundle)).await;
        assert_eq!(api.runtime_version().spec_version, 7);
        assert!(api.registry().unwrap().contains_key("Candidate"));
    }

    #[tokio::test]
    async fn test_unknown_runtime_has_no_registry() {
        let mock = Arc::new(MockTransport::new());
        mock.push_result("state_getRuntimeVersion", runtime_version("kusama", 9000)).await;
        let bundle = TypesBundle::shadows().unwrap();

        let api = connected(&mock, Some(&bundle)).await;
        assert!(api.registry().is_none());
    }

    #[tokio::test]
    async fn test_create_block_sends_flags_and_null_parent() {
        let mock = Arc::new(MockTransport::new());
        mock.push_result("state_getRuntimeVersion", runtime_version("node-shadows", 1)).await;
        mock.push_result(
            "engine_createBlock",
            json!({"hash": format!("{:#x}", B256::repeat_byte(0xab)), "aux": {"header_only": false}}),
        )
        .await;

        let api = connected(&mock, None).await;
        let created = api.seal_block(true).await.unwrap();
        assert_eq!(created.hash, B256::repeat_byte(0xab));

        let calls = mock.calls().await;
        assert_eq!(calls[1].params, vec![json!(true), json!(true), Value::Null]);
    }

    #[tokio::test]
    async fn test_node_error_is_raised() {
        let mock = Arc::new(MockTransport::new());
        mock.push_result("state_getRuntimeVersion", runtime_version("node-shadows", 1)).await;
        mock.push_node_error("engine_finalizeBlock", -32603, "block not found").await;

        let api = connected(&mock, None).await;
        let err = api.finalize_block(&B256::ZERO, None).await.unwrap_err();
        assert_eq!(err.current_context(), &HarnessError::Rpc);
    }

    #[tokio::test]
    async fn test_rpc_methods_are_listed() {
        let mock = Arc::new(MockTransport::new());
        mock.push_result("state_getRuntimeVersion", runtime_version("node-shadows", 1)).await;
        mock.push_result("rpc_methods", json!({"version": 1, "methods": ["eth_chainId", "engine_createBlock"]}))
            .await;

        let api = connected(&mock, None).await;
        assert_eq!(api.rpc_methods().await.unwrap(), vec!["eth_chainId", "engine_createBlock"]);
    }

    #[tokio::test]
    async fn test_chain_queries() {
        let mock = Arc::new(MockTransport::new());
        mock.push_result("state_getRuntimeVersion", runtime_version("node-shadows", 1)).await;
        let head = B256::repeat_byte(0x11);
        mock.push_result("chain_getFinalizedHead", json!(format!("{:#x}", head))).await;
        mock.push_result("chain_getHeader", json!({"number": "0x1", "parentHash": format!("{:#x}", B256::ZERO)}))
            .await;
        mock.push_result("chain_getBlockHash", json!(format!("{:#x}", head))).await;
        mock.push_result("chain_getBlockHash", Value::Null).await;

        let api = connected(&mock, None).await;
        assert_eq!(api.finalized_head().await.unwrap(), head);
        assert_eq!(api.header(Some(&head)).await.unwrap()["number"], "0x1");
        assert_eq!(api.block_hash(1).await.unwrap(), Some(head));
        assert_eq!(api.block_hash(99).await.unwrap(), None);

        let calls = mock.calls().await;
        assert_eq!(calls[2].params, vec![json!(head)]);
        assert_eq!(calls[4].params, vec![json!(99)]);
    }

    #[tokio::test]
    async fn test_disconnect_closes_transport() {
        let mock = Arc::new(MockTransport::new());
        mock.push_result("state_getRuntimeVersion", runtime_version("node-shadows", 1)).await;
        let api = connected(&mock, None).await;
        api.disconnect().await;
        assert!(mock.is_closed());
    }
}
