use std::process;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use error_stack::Report;
use shadows_test_harness::config::{DEFAULT_PORT, DEFAULT_RPC_PORT, DEFAULT_WS_PORT};
use shadows_test_harness::errors::{render_fatal, HarnessError, HarnessResult};
use shadows_test_harness::{
    create_and_finalize_block, describe_with_shadows, HarnessConfig, LogCtx, NodeProfile,
    SuiteLifecycle,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Start a Shadows node and keep it running until Ctrl-C
    #[clap(name = "start", bin_name = "start")]
    Start(StartNode),
    /// Start a node, check its chain id, seal one block and tear it down
    #[clap(name = "smoke", bin_name = "smoke")]
    Smoke(SmokeTest),
}

#[derive(Parser, PartialEq, Clone, Debug)]
pub struct StartNode {
    #[clap(flatten)]
    pub node: NodeOptions,
}

#[derive(Parser, PartialEq, Clone, Debug)]
pub struct SmokeTest {
    #[clap(flatten)]
    pub node: NodeOptions,
}

#[derive(Parser, PartialEq, Clone, Debug)]
pub struct NodeOptions {
    /// Path to the compiled node (defaults to $SHADOWS_BINARY_PATH, then ../target/release/shadows-node)
    #[arg(long = "binary-path", short = 'b')]
    pub binary_path: Option<String>,
    /// p2p port of the node
    #[arg(long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// HTTP JSON-RPC port of the node
    #[arg(long = "rpc-port", default_value_t = DEFAULT_RPC_PORT)]
    pub rpc_port: u16,
    /// WebSocket port of the node
    #[arg(long = "ws-port", default_value_t = DEFAULT_WS_PORT)]
    pub ws_port: u16,
    /// Transport of the Ethereum client: http or ws (defaults to $SHADOWS_PROVIDER, then http)
    #[arg(long = "provider", short = 'p', value_parser = ["http", "ws"])]
    pub provider: Option<String>,
    /// Chain profile: dev or development
    #[arg(long = "profile", value_parser = ["dev", "development"])]
    pub profile: Option<String>,
    /// Block author for the development profile, in hex
    #[arg(long = "author-id")]
    pub author_id: Option<String>,
    /// Do not echo the node output
    #[arg(long = "quiet", short = 'q', action=ArgAction::SetTrue)]
    pub quiet: bool,
    /// Spawn timeout in milliseconds, readiness safety margin included
    #[arg(long = "timeout-ms")]
    pub timeout_ms: Option<u64>,
}

impl NodeOptions {
    /// Defaults, then `SHADOWS_*` variables from `vars`, then the flags.
    pub fn to_config<I>(&self, vars: I) -> HarnessResult<HarnessConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut builder = HarnessConfig::builder()
            .with_env(vars)?
            .ports(self.port, self.rpc_port, self.ws_port);
        if let Some(ref binary_path) = self.binary_path {
            builder = builder.binary_path(binary_path);
        }
        if let Some(ref provider) = self.provider {
            builder = builder.provider(provider.parse()?);
        }
        match (self.profile.as_deref(), self.author_id.as_ref()) {
            (Some("development"), Some(author_id)) => {
                builder = builder.profile(NodeProfile::Development { author_id: author_id.clone() })
            }
            (Some(profile), _) => builder = builder.profile(profile.parse()?),
            (None, _) => {}
        }
        if self.quiet {
            builder = builder.display_log(false);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            builder = builder.spawn_timeout(Duration::from_millis(timeout_ms));
        }
        builder.build()
    }
}

pub fn main() {
    let logger = hiro_system_kit::log::setup_logger();
    let _guard = hiro_system_kit::log::setup_global_logger(logger.clone());
    let ctx = LogCtx::new(logger);

    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            println!("{}", e);
            process::exit(1);
        }
    };

    match hiro_system_kit::nestable_block_on(handle_command(opts, &ctx)) {
        Err(report) => {
            if let Some(banner) = fatal_banner(&report) {
                println!("{}", banner);
            }
            error!(ctx.expect_logger(), "{:?}", report);
            std::thread::sleep(std::time::Duration::from_millis(500));
            process::exit(1);
        }
        Ok(_) => {}
    }
}

/// Operator-facing message for fatal kinds, `None` for the others.
fn fatal_banner(report: &Report<HarnessError>) -> Option<String> {
    if !report.current_context().is_fatal() {
        return None;
    }
    Some(format!("{}", red!(render_fatal(report))))
}

async fn handle_command(opts: Opts, ctx: &LogCtx) -> HarnessResult<()> {
    match opts.command {
        Command::Start(cmd) => {
            let config = cmd.node.to_config(std::env::vars())?;
            handle_start_command(config, ctx).await?;
        }
        Command::Smoke(cmd) => {
            let config = cmd.node.to_config(std::env::vars())?;
            handle_smoke_command(config, ctx).await?;
        }
    }
    Ok(())
}

async fn handle_start_command(config: HarnessConfig, ctx: &LogCtx) -> HarnessResult<()> {
    let mut suite = SuiteLifecycle::new("shadows-e2e start", config, ctx);
    if let Err(report) = suite.setup().await {
        suite.teardown().await;
        return Err(report);
    }

    let context = suite.context();
    let runtime = context.chain().await?.runtime_version().clone();
    println!(
        "{} Shadows node ready ({} v{})",
        green!("✔"),
        runtime.spec_name,
        runtime.spec_version
    );
    println!("  Ethereum RPC: {}", context.eth().await?.endpoint());
    println!("  WebSocket:    {}", suite.config().ws_url());
    println!("{}", yellow!("Press Ctrl-C to stop the node"));

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        if let Err(_e) = stop_tx.send(()) {
            std::process::exit(1);
        }
    })
    .expect("Error setting Ctrl-C handler");
    let _ = stop_rx.recv().await;

    info!(ctx.expect_logger(), "Stopping Shadows node");
    suite.teardown().await;
    Ok(())
}

async fn handle_smoke_command(config: HarnessConfig, ctx: &LogCtx) -> HarnessResult<()> {
    describe_with_shadows("shadows-e2e smoke", config, ctx, |context| async move {
        let eth = context.eth().await?;
        let chain = context.chain().await?;

        let chain_id = eth.chain_id().await?;
        println!("{} chain id {}", green!("✔"), chain_id);

        let before = eth.block_number().await?;
        let elapsed = create_and_finalize_block(&chain).await;
        let after = eth.block_number().await?;
        if after > before {
            println!("{} sealed block {} in {} ms", green!("✔"), after, elapsed.as_millis());
            Ok(())
        } else {
            println!("{} block height still {} after {} ms", red!("✘"), after, elapsed.as_millis());
            Err(shadows_test_harness::harness_error!(
                HarnessError::InvalidResponse,
                "block production did not advance the chain"
            ))
        }
    })
    .await
}
