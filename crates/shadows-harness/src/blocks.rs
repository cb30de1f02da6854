//! Block production helpers.
//!
//! The chain-API variant swallows failures: a block that did not seal is
//! diagnosed from the node log, and raising here would abort unrelated
//! assertions of the same test. The Ethereum-envelope variant raises.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::chain::ChainApi;
use crate::errors::{HarnessError, HarnessResult};
use crate::eth::EthRpc;
use crate::rpc::JsonRpcResponse;

/// Seals and finalizes one block with every pending transaction. Never
/// fails; returns the time spent.
pub async fn create_and_finalize_block(chain: &ChainApi) -> Duration {
    let started = Instant::now();
    let ctx = chain.log_ctx();
    ctx.try_log(|logger| debug!(logger, " <== createBlock(true, true)"));
    match chain.create_block(true, true, None).await {
        Ok(response) => ctx.try_log(|logger| debug!(logger, " ==> {}", response)),
        Err(e) => ctx.try_log(|logger| error!(logger, "ERROR DURING BLOCK FINALIZATION {:?}", e)),
    }
    started.elapsed()
}

/// Same request sent through the Ethereum client, failing on a falsy result.
pub async fn create_and_finalize_block_via_eth(eth: &EthRpc) -> HarnessResult<JsonRpcResponse> {
    let response = eth
        .custom_request("engine_createBlock", vec![json!(true), json!(true), Value::Null])
        .await?;
    if !is_truthy(response.result.as_ref()) {
        let rendered = serde_json::to_string(&response).unwrap_or_default();
        return Err(harness_error!(HarnessError::InvalidResponse, "Unexpected result: {}", rendered));
    }
    Ok(response)
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map_or(true, |n| n != 0.0),
        Some(_) => true,
    }
}
