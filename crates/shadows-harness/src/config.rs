use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use regex::Regex;

use crate::errors::{CommandLine, HarnessError, HarnessResult};
use crate::types_bundle::TypesBundle;

pub const DEFAULT_PORT: u16 = 19931;
pub const DEFAULT_RPC_PORT: u16 = 19932;
pub const DEFAULT_WS_PORT: u16 = 19933;
pub const DEFAULT_BINARY_PATH: &str = "../target/release/shadows-node";
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Kept out of the readiness window so the suite-level timeout never races it.
pub const SPAWN_SAFETY_MARGIN: Duration = Duration::from_millis(2_000);

/// Author of manually sealed blocks on the `development` chain.
pub const GENESIS_ACCOUNT: &str = "0xAA7358886fd6FEc1d64323D9da340FD3c0B9a9E4";

pub const DEV_READY_MARKER: &str = "Shadows severce Ready";
pub const MANUAL_SEAL_READY_MARKER: &str = "Manual Seal Ready";

pub const ENV_BINARY_PATH: &str = "SHADOWS_BINARY_PATH";
pub const ENV_LOG: &str = "SHADOWS_LOG";
pub const ENV_DISPLAY_LOG: &str = "SHADOWS_DISPLAY_LOG";
pub const ENV_PROVIDER: &str = "SHADOWS_PROVIDER";

/// Transport used by the Ethereum JSON-RPC client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provider {
    #[default]
    Http,
    Ws,
}

impl FromStr for Provider {
    type Err = Report<HarnessError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "http" => Ok(Provider::Http),
            "ws" => Ok(Provider::Ws),
            other => Err(harness_error!(
                HarnessError::InvalidConfig,
                "unknown provider '{}', expected 'http' or 'ws'",
                other
            )),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Http => write!(f, "http"),
            Provider::Ws => write!(f, "ws"),
        }
    }
}

/// Chain selection and sealing flavour handed to the node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeProfile {
    /// `--dev` chain with `--sealing=Manual`
    #[default]
    Dev,
    /// `development` chain spec, authored by `author_id` with `--manual-seal`
    Development { author_id: String },
}

impl NodeProfile {
    pub fn development() -> NodeProfile {
        NodeProfile::Development { author_id: GENESIS_ACCOUNT.to_string() }
    }

    /// Literal the node prints once its RPC servers accept requests.
    pub fn ready_marker(&self) -> &'static str {
        match self {
            NodeProfile::Dev => DEV_READY_MARKER,
            NodeProfile::Development { .. } => MANUAL_SEAL_READY_MARKER,
        }
    }

    pub fn spawn_args(&self, port: u16, rpc_port: u16, ws_port: u16, log_filter: &str) -> Vec<String> {
        let mut args = match self {
            NodeProfile::Dev => vec![
                "--dev".to_string(),
                "--execution=Native".to_string(),
                "--no-telemetry".to_string(),
                "--no-prometheus".to_string(),
                "--sealing=Manual".to_string(),
                "--no-grandpa".to_string(),
            ],
            NodeProfile::Development { author_id } => vec![
                "--chain=development".to_string(),
                // manual sealing only authors blocks on a validator
                "--validator".to_string(),
                "--execution=Native".to_string(),
                "--no-telemetry".to_string(),
                "--no-prometheus".to_string(),
                "--manual-seal".to_string(),
                format!("--author-id={}", author_id.trim_start_matches("0x")),
                "--no-grandpa".to_string(),
                "--force-authoring".to_string(),
                format!("-l{}", log_filter),
            ],
        };
        args.push(format!("--port={}", port));
        args.push(format!("--rpc-port={}", rpc_port));
        args.push(format!("--ws-port={}", ws_port));
        args.push("--tmp".to_string());
        args
    }
}

impl FromStr for NodeProfile {
    type Err = Report<HarnessError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(NodeProfile::Dev),
            "development" => Ok(NodeProfile::development()),
            other => Err(harness_error!(
                HarnessError::InvalidConfig,
                "unknown node profile '{}', expected 'dev' or 'development'",
                other
            )),
        }
    }
}

/// Immutable description of one node launch.
///
/// Built once at the boundary (see [`HarnessConfig::from_env`]) and passed by
/// reference into every component; nothing below reads the environment.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    binary_path: PathBuf,
    port: u16,
    rpc_port: u16,
    ws_port: u16,
    spawn_args: Vec<String>,
    spawn_timeout: Duration,
    ready_marker: Regex,
    display_log: bool,
    provider: Provider,
    profile: NodeProfile,
    log_filter: String,
    types_bundle: Option<TypesBundle>,
}

impl HarnessConfig {
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    /// Defaults overridden by `SHADOWS_*` variables of the current process.
    pub fn from_env() -> HarnessResult<HarnessConfig> {
        HarnessConfig::builder().with_env(std::env::vars())?.build()
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    pub fn ws_port(&self) -> u16 {
        self.ws_port
    }

    pub fn spawn_args(&self) -> &[String] {
        &self.spawn_args
    }

    pub fn spawn_timeout(&self) -> Duration {
        self.spawn_timeout
    }

    /// Deadline for the readiness marker: the spawn timeout minus the safety margin.
    pub fn detection_window(&self) -> Duration {
        self.spawn_timeout.saturating_sub(SPAWN_SAFETY_MARGIN)
    }

    pub fn ready_marker(&self) -> &Regex {
        &self.ready_marker
    }

    pub fn display_log(&self) -> bool {
        self.display_log
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn profile(&self) -> &NodeProfile {
        &self.profile
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn types_bundle(&self) -> Option<&TypesBundle> {
        self.types_bundle.as_ref()
    }

    pub fn http_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.rpc_port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.ws_port)
    }

    pub fn command_line(&self) -> CommandLine {
        CommandLine {
            program: self.binary_path.display().to_string(),
            args: self.spawn_args.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfigBuilder {
    binary_path: PathBuf,
    port: u16,
    rpc_port: u16,
    ws_port: u16,
    spawn_args: Option<Vec<String>>,
    spawn_timeout: Duration,
    ready_marker: Option<String>,
    display_log: bool,
    provider: Provider,
    profile: NodeProfile,
    log_filter: String,
    types_bundle: BundleChoice,
}

#[derive(Debug, Clone)]
enum BundleChoice {
    Builtin,
    Custom(TypesBundle),
    Disabled,
}

impl Default for HarnessConfigBuilder {
    fn default() -> Self {
        HarnessConfigBuilder {
            binary_path: PathBuf::from(DEFAULT_BINARY_PATH),
            port: DEFAULT_PORT,
            rpc_port: DEFAULT_RPC_PORT,
            ws_port: DEFAULT_WS_PORT,
            spawn_args: None,
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            ready_marker: None,
            display_log: true,
            provider: Provider::Http,
            profile: NodeProfile::Dev,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            types_bundle: BundleChoice::Builtin,
        }
    }
}

impl HarnessConfigBuilder {
    pub fn binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = path.into();
        self
    }

    pub fn ports(mut self, port: u16, rpc_port: u16, ws_port: u16) -> Self {
        self.port = port;
        self.rpc_port = rpc_port;
        self.ws_port = ws_port;
        self
    }

    /// Replaces the argument list derived from the profile.
    pub fn spawn_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spawn_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Regular expression searched in each output chunk; defaults to the
    /// profile's literal marker.
    pub fn ready_marker(mut self, pattern: impl Into<String>) -> Self {
        self.ready_marker = Some(pattern.into());
        self
    }

    pub fn display_log(mut self, display_log: bool) -> Self {
        self.display_log = display_log;
        self
    }

    pub fn provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    pub fn profile(mut self, profile: NodeProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn types_bundle(mut self, bundle: TypesBundle) -> Self {
        self.types_bundle = BundleChoice::Custom(bundle);
        self
    }

    pub fn without_types_bundle(mut self) -> Self {
        self.types_bundle = BundleChoice::Disabled;
        self
    }

    /// Applies `SHADOWS_*` overrides found in `vars`.
    pub fn with_env<I>(mut self, vars: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_BINARY_PATH if !value.is_empty() => self.binary_path = PathBuf::from(value),
                ENV_LOG if !value.is_empty() => self.log_filter = value,
                ENV_DISPLAY_LOG if !value.is_empty() => self.display_log = parse_flag(&value),
                ENV_PROVIDER => {
                    self.provider = value
                        .parse::<Provider>()
                        .attach_printable_lazy(|| format!("while reading {}", ENV_PROVIDER))?
                }
                _ => {}
            }
        }
        Ok(self)
    }

    pub fn build(self) -> HarnessResult<HarnessConfig> {
        if self.port == 0 || self.rpc_port == 0 || self.ws_port == 0 {
            return Err(harness_error!(HarnessError::InvalidConfig, "node ports must be non-zero"));
        }
        if self.port == self.rpc_port || self.port == self.ws_port || self.rpc_port == self.ws_port {
            return Err(harness_error!(
                HarnessError::InvalidConfig,
                "node ports must be distinct (port {}, rpc {}, ws {})",
                self.port,
                self.rpc_port,
                self.ws_port
            ));
        }

        let pattern = self
            .ready_marker
            .unwrap_or_else(|| regex::escape(self.profile.ready_marker()));
        let ready_marker = Regex::new(&pattern)
            .map_err(|e| Report::new(e).change_context(HarnessError::InvalidConfig))
            .attach_printable_lazy(|| format!("invalid ready marker pattern '{}'", pattern))?;

        let spawn_args = match self.spawn_args {
            Some(args) => args,
            None => self.profile.spawn_args(self.port, self.rpc_port, self.ws_port, &self.log_filter),
        };

        let types_bundle = match self.types_bundle {
            BundleChoice::Builtin => Some(TypesBundle::shadows()?),
            BundleChoice::Custom(bundle) => Some(bundle),
            BundleChoice::Disabled => None,
        };

        Ok(HarnessConfig {
            binary_path: self.binary_path,
            port: self.port,
            rpc_port: self.rpc_port,
            ws_port: self.ws_port,
            spawn_args,
            spawn_timeout: self.spawn_timeout,
            ready_marker,
            display_log: self.display_log,
            provider: self.provider,
            profile: self.profile,
            log_filter: self.log_filter,
            types_bundle,
        })
    }
}

/// Any value other than an explicit "off" keeps the echo on.
fn parse_flag(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::builder().build().unwrap();
        assert_eq!(config.binary_path(), Path::new(DEFAULT_BINARY_PATH));
        assert_eq!(config.port(), 19931);
        assert_eq!(config.rpc_port(), 19932);
        assert_eq!(config.ws_port(), 19933);
        assert_eq!(config.provider(), Provider::Http);
        assert_eq!(config.detection_window(), Duration::from_millis(28_000));
        assert_eq!(config.http_url(), "http://127.0.0.1:19932");
        assert_eq!(config.ws_url(), "ws://127.0.0.1:19933");
        assert!(config.ready_marker().is_match("2021-04-01 Shadows severce Ready"));
        assert!(config.types_bundle().is_some());
        assert!(config.display_log());
    }

    #[test]
    fn test_dev_profile_arguments() {
        let config = HarnessConfig::builder().build().unwrap();
        assert_eq!(
            config.spawn_args(),
            &[
                "--dev",
                "--execution=Native",
                "--no-telemetry",
                "--no-prometheus",
                "--sealing=Manual",
                "--no-grandpa",
                "--port=19931",
                "--rpc-port=19932",
                "--ws-port=19933",
                "--tmp",
            ]
        );
    }

    #[test]
    fn test_development_profile_arguments() {
        let config = HarnessConfig::builder()
            .profile(NodeProfile::development())
            .log_filter("debug")
            .build()
            .unwrap();
        let args = config.spawn_args();
        assert_eq!(args[0], "--chain=development");
        assert!(args.contains(&"--manual-seal".to_string()));
        assert!(args.contains(&"--force-authoring".to_string()));
        assert!(args.contains(&"--author-id=AA7358886fd6FEc1d64323D9da340FD3c0B9a9E4".to_string()));
        assert!(args.contains(&"-ldebug".to_string()));
        assert_eq!(args.last().unwrap(), "--tmp");
        assert!(config.ready_marker().is_match("Manual Seal Ready"));
        assert!(!config.ready_marker().is_match("Shadows severce Ready"));
    }

    #[test]
    fn test_detection_window_saturates() {
        let config = HarnessConfig::builder()
            .spawn_timeout(Duration::from_millis(1_500))
            .build()
            .unwrap();
        assert_eq!(config.detection_window(), Duration::ZERO);
    }

    #[test_case(19931, 19931, 19933 ; "port equals rpc port")]
    #[test_case(19931, 19932, 19932 ; "rpc port equals ws port")]
    #[test_case(0, 19932, 19933 ; "zero port")]
    fn test_rejects_bad_ports(port: u16, rpc_port: u16, ws_port: u16) {
        let err = HarnessConfig::builder().ports(port, rpc_port, ws_port).build().unwrap_err();
        assert_eq!(err.current_context(), &HarnessError::InvalidConfig);
    }

    #[test]
    fn test_rejects_invalid_marker() {
        let err = HarnessConfig::builder().ready_marker("Ready(").build().unwrap_err();
        assert_eq!(err.current_context(), &HarnessError::InvalidConfig);
    }

    #[test_case("1", true)]
    #[test_case("true", true)]
    #[test_case("YES", true)]
    #[test_case("0", false)]
    #[test_case("Off", false)]
    #[test_case("info", true)]
    #[test_case("", true)]
    fn test_display_log_from_env(value: &str, expected: bool) {
        let config = HarnessConfig::builder()
            .with_env(env(&[(ENV_DISPLAY_LOG, value)]))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.display_log(), expected);
    }

    #[test]
    fn test_env_overrides() {
        let config = HarnessConfig::builder()
            .profile(NodeProfile::development())
            .with_env(env(&[
                (ENV_BINARY_PATH, "/opt/shadows/shadows-node"),
                (ENV_LOG, "evm=trace"),
                (ENV_PROVIDER, "ws"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.binary_path(), Path::new("/opt/shadows/shadows-node"));
        assert_eq!(config.log_filter(), "evm=trace");
        assert_eq!(config.provider(), Provider::Ws);
        assert!(config.spawn_args().contains(&"-levm=trace".to_string()));
    }

    #[test]
    fn test_env_rejects_unknown_provider() {
        let err = HarnessConfig::builder()
            .with_env(env(&[(ENV_PROVIDER, "ipc")]))
            .unwrap_err();
        assert_eq!(err.current_context(), &HarnessError::InvalidConfig);
    }

    #[test]
    fn test_custom_arguments_and_command_line() {
        let config = HarnessConfig::builder()
            .binary_path("/bin/sh")
            .spawn_args(["-c", "echo ready"])
            .build()
            .unwrap();
        assert_eq!(config.command_line().to_string(), "/bin/sh -c echo ready");
    }

    #[test_case("dev", NodeProfile::Dev)]
    #[test_case("Development", NodeProfile::development())]
    fn test_profile_from_str(value: &str, expected: NodeProfile) {
        assert_eq!(value.parse::<NodeProfile>().unwrap(), expected);
    }
}
