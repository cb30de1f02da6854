//! Suite lifecycle: `Idle -> Starting -> Ready -> TornDown`.
//!
//! One [`SuiteLifecycle`] owns one node process. The shared [`Context`] is
//! created empty with the lifecycle and filled in place once the node is
//! ready, so handles taken before setup observe the clients afterwards.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::chain::ChainApi;
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessErrorExt, HarnessResult};
use crate::eth::EthRpc;
use crate::logging::LogCtx;
use crate::process::NodeProcess;
use crate::readiness::ReadinessDetector;
use crate::rpc::{Transport, WsTransport};
use crate::transport::{self, Transports};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteState {
    Idle,
    Starting,
    Ready,
    TornDown,
}

impl fmt::Display for SuiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuiteState::Idle => write!(f, "idle"),
            SuiteState::Starting => write!(f, "starting"),
            SuiteState::Ready => write!(f, "ready"),
            SuiteState::TornDown => write!(f, "torn down"),
        }
    }
}

/// Clients shared with every test of a suite.
#[derive(Debug, Default)]
pub struct Context {
    eth: RwLock<Option<EthRpc>>,
    chain: RwLock<Option<ChainApi>>,
    ws_provider: RwLock<Option<Arc<WsTransport>>>,
}

pub type SharedContext = Arc<Context>;

impl Context {
    pub async fn eth(&self) -> HarnessResult<EthRpc> {
        self.eth.read().await.clone().ok_or_else(|| not_ready("eth"))
    }

    pub async fn chain(&self) -> HarnessResult<ChainApi> {
        self.chain.read().await.clone().ok_or_else(|| not_ready("chain"))
    }

    pub async fn ws_provider(&self) -> HarnessResult<Arc<WsTransport>> {
        self.ws_provider.read().await.clone().ok_or_else(|| not_ready("ws_provider"))
    }

    pub async fn is_populated(&self) -> bool {
        self.eth.read().await.is_some()
            && self.chain.read().await.is_some()
            && self.ws_provider.read().await.is_some()
    }

    async fn populate(&self, transports: Transports) {
        *self.eth.write().await = Some(transports.eth);
        *self.chain.write().await = Some(transports.chain);
        *self.ws_provider.write().await = Some(transports.ws_provider);
    }

    async fn clear(&self) -> (Option<EthRpc>, Option<ChainApi>, Option<Arc<WsTransport>>) {
        (
            self.eth.write().await.take(),
            self.chain.write().await.take(),
            self.ws_provider.write().await.take(),
        )
    }
}

fn not_ready(field: &str) -> error_stack::Report<HarnessError> {
    harness_error!(HarnessError::NotReady, "context.{} read before the suite was ready", field)
}

pub struct SuiteLifecycle {
    title: String,
    config: HarnessConfig,
    ctx: LogCtx,
    state: SuiteState,
    context: SharedContext,
    process: Option<NodeProcess>,
    log_drain: Option<JoinHandle<()>>,
}

impl SuiteLifecycle {
    pub fn new(title: impl Into<String>, config: HarnessConfig, ctx: &LogCtx) -> Self {
        Self {
            title: title.into(),
            config,
            ctx: ctx.clone(),
            state: SuiteState::Idle,
            context: Arc::new(Context::default()),
            process: None,
            log_drain: None,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn state(&self) -> SuiteState {
        self.state
    }

    pub fn context(&self) -> SharedContext {
        self.context.clone()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Spawns the node, waits for readiness and connects the clients. Steps
    /// run strictly in sequence; the first failure is returned as is and
    /// leaves the suite in `Starting` for [`SuiteLifecycle::teardown`].
    pub async fn setup(&mut self) -> HarnessResult<()> {
        if self.state != SuiteState::Idle {
            return Err(harness_error!(
                HarnessError::InvalidTransition,
                "suite '{}' cannot start from state {}",
                self.title,
                self.state
            ));
        }
        self.state = SuiteState::Starting;
        self.ctx.try_log(|logger| info!(logger, "Starting suite '{}'", self.title));

        let warm = transport::warm_client(&self.config, &self.ctx);
        let (process, mut stream) = NodeProcess::spawn(&self.config, &self.ctx)?;
        let command_line = process.command_line().clone();
        self.process = Some(process);

        let readiness = ReadinessDetector::for_config(&self.config)
            .with_warmup(warm.as_ref())
            .await_ready(&mut stream, &self.ctx)
            .await
            .with_command_line(command_line.clone())?;
        readiness.into_result(&command_line)?;
        self.log_drain = Some(stream.detach(self.config.display_log()));

        let transports = transport::connect(&self.config, warm, &self.ctx).await?;
        self.context.populate(transports).await;
        self.state = SuiteState::Ready;
        Ok(())
    }

    /// Disconnects the chain-API provider, then kills the node. Tolerates a
    /// partially started suite and never fails; later calls are no-ops.
    pub async fn teardown(&mut self) {
        if self.state == SuiteState::TornDown {
            return;
        }
        let (eth, _chain, ws_provider) = self.context.clear().await;
        if let Some(ws_provider) = ws_provider {
            ws_provider.close().await;
        }
        if let Some(eth) = eth {
            eth.disconnect().await;
        }
        if let Some(mut process) = self.process.take() {
            process.kill(&self.ctx).await;
        }
        if let Some(log_drain) = self.log_drain.take() {
            log_drain.abort();
        }
        self.ctx.try_log(|logger| info!(logger, "Suite '{}' torn down", self.title));
        self.state = SuiteState::TornDown;
    }
}

/// Runs `body` against a dedicated node, tearing it down on every exit path.
///
/// A setup failure is returned without running `body`; fatal kinds (see
/// [`HarnessError::is_fatal`]) are meant to end the whole run. A panic in
/// `body` is resumed once the node is gone.
pub async fn describe_with_shadows<F, Fut>(
    title: &str,
    config: HarnessConfig,
    ctx: &LogCtx,
    body: F,
) -> HarnessResult<()>
where
    F: FnOnce(SharedContext) -> Fut,
    Fut: Future<Output = HarnessResult<()>> + Send + 'static,
{
    let mut suite = SuiteLifecycle::new(title, config, ctx);
    if let Err(report) = suite.setup().await {
        suite.teardown().await;
        return Err(report);
    }

    let outcome = tokio::spawn(body(suite.context())).await;
    suite.teardown().await;

    match outcome {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(harness_error!(HarnessError::SuiteAborted, "suite '{}' was cancelled", title)),
    }
}
