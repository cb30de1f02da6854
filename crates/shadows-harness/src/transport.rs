use std::sync::Arc;

use crate::chain::ChainApi;
use crate::config::{HarnessConfig, Provider};
use crate::errors::HarnessResult;
use crate::eth::EthRpc;
use crate::logging::LogCtx;
use crate::rpc::WsTransport;

/// Connections opened once the node is ready.
///
/// The chain API always gets its own WebSocket, even when the Ethereum client
/// also speaks WebSocket, so closing one never closes the other.
#[derive(Debug, Clone)]
pub struct Transports {
    pub eth: EthRpc,
    pub chain: ChainApi,
    pub ws_provider: Arc<WsTransport>,
}

/// The client used for the readiness warm-up. Only HTTP setups warm up: a
/// WebSocket client cannot be opened before the node listens.
pub fn warm_client(config: &HarnessConfig, ctx: &LogCtx) -> Option<EthRpc> {
    match config.provider() {
        Provider::Http => Some(EthRpc::http(config.http_url()).with_logger(ctx)),
        Provider::Ws => None,
    }
}

/// Opens the Ethereum client and the chain API. `warm` is reused as the
/// Ethereum client when present. Failures propagate without retry.
pub async fn connect(config: &HarnessConfig, warm: Option<EthRpc>, ctx: &LogCtx) -> HarnessResult<Transports> {
    let ws_provider = Arc::new(WsTransport::connect(config.ws_url()).await?);
    let chain = ChainApi::create(ws_provider.clone(), config.types_bundle(), ctx).await?;

    let eth = match (config.provider(), warm) {
        (Provider::Ws, _) => EthRpc::ws(config.ws_url()).await?.with_logger(ctx),
        (Provider::Http, Some(warm)) => warm,
        (Provider::Http, None) => EthRpc::http(config.http_url()).with_logger(ctx),
    };
    ctx.try_log(|logger| {
        info!(logger, "Connected {} client on {}", config.provider(), eth.endpoint())
    });

    Ok(Transports { eth, chain, ws_provider })
}
