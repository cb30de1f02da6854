use std::fmt;

pub use error_stack::Report;
use error_stack::Context;

/// Harness error kinds.
///
/// The process-level kinds (see [`HarnessError::is_fatal`]) invalidate the whole
/// run: a node that cannot start makes every later assertion meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessError {
    /// The node binary does not exist at the configured path
    BinaryNotFound,
    /// The node binary exists but could not be started
    SpawnFailed,
    /// The readiness marker did not show up within the detection window
    ReadinessTimeout,
    /// The node closed its output before printing the readiness marker
    NodeExited,
    /// The EVM warm-up call issued on readiness failed
    WarmupFailed,
    /// A transport could not reach the node, or lost the connection
    Connection,
    /// The node answered with a JSON-RPC error object
    Rpc,
    /// The node answered with something that does not decode
    InvalidResponse,
    /// The harness configuration is inconsistent
    InvalidConfig,
    /// A context field was read before the suite reached `Ready`
    NotReady,
    /// A lifecycle operation was invoked from the wrong state
    InvalidTransition,
    /// The suite body was cancelled before completing
    SuiteAborted,
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::BinaryNotFound => write!(f, "Node binary not found"),
            HarnessError::SpawnFailed => write!(f, "Failed to spawn node process"),
            HarnessError::ReadinessTimeout => write!(f, "Node did not become ready in time"),
            HarnessError::NodeExited => write!(f, "Node exited before becoming ready"),
            HarnessError::WarmupFailed => write!(f, "EVM warm-up call failed"),
            HarnessError::Connection => write!(f, "Connection to node failed"),
            HarnessError::Rpc => write!(f, "Node returned an RPC error"),
            HarnessError::InvalidResponse => write!(f, "Unexpected RPC response"),
            HarnessError::InvalidConfig => write!(f, "Invalid harness configuration"),
            HarnessError::NotReady => write!(f, "Suite context used before the node was ready"),
            HarnessError::InvalidTransition => write!(f, "Invalid suite lifecycle transition"),
            HarnessError::SuiteAborted => write!(f, "Suite body aborted"),
        }
    }
}

impl Context for HarnessError {}

impl HarnessError {
    /// Whether this error must terminate the whole test run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::BinaryNotFound
                | HarnessError::SpawnFailed
                | HarnessError::ReadinessTimeout
                | HarnessError::NodeExited
                | HarnessError::WarmupFailed
        )
    }
}

pub type HarnessResult<T> = Result<T, Report<HarnessError>>;

/// Command line of the spawned node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Everything the node printed before the failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLogs(pub String);

impl fmt::Display for CapturedLogs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RPC call details for connection and node errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcContext {
    pub endpoint: String,
    pub method: String,
    pub params: Option<String>,
}

impl fmt::Display for RpcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.method, self.endpoint)?;
        if let Some(params) = &self.params {
            write!(f, " with params {}", params)?;
        }
        Ok(())
    }
}

/// Helpers attaching harness diagnostics to a report
pub trait HarnessErrorExt {
    fn with_command_line(self, command_line: CommandLine) -> Self;

    fn with_captured_logs(self, logs: impl Into<String>) -> Self;

    fn with_rpc_context(
        self,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        params: Option<String>,
    ) -> Self;
}

impl<T> HarnessErrorExt for Result<T, Report<HarnessError>> {
    fn with_command_line(self, command_line: CommandLine) -> Self {
        self.map_err(|e| e.attach(command_line))
    }

    fn with_captured_logs(self, logs: impl Into<String>) -> Self {
        self.map_err(|e| e.attach(CapturedLogs(logs.into())))
    }

    fn with_rpc_context(
        self,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        params: Option<String>,
    ) -> Self {
        self.map_err(|e| {
            e.attach(RpcContext { endpoint: endpoint.into(), method: method.into(), params })
        })
    }
}

/// Helper macro for creating harness errors
#[macro_export]
macro_rules! harness_error {
    ($error:expr, $($arg:tt)*) => {{
        $crate::errors::Report::new($error).attach_printable(format!($($arg)*))
    }};
}

/// Renders the diagnostic block printed before a fatal exit: the failure
/// headline, the command line that was run and the captured node output.
pub fn render_fatal(report: &Report<HarnessError>) -> String {
    let command_line = report.downcast_ref::<CommandLine>();
    let mut rendered = match report.current_context() {
        HarnessError::BinaryNotFound => {
            let program = command_line.map(|c| c.program.as_str()).unwrap_or("<unknown>");
            format!(
                "Missing Shadows binary ({}).\nPlease compile the Shadows project:\ncargo build --release",
                program
            )
        }
        HarnessError::SpawnFailed => "Failed to spawn Shadows Test Node.".to_string(),
        _ => "Failed to start Shadows Test Node.".to_string(),
    };
    if let Some(command_line) = command_line {
        rendered.push_str(&format!("\nCommand: {}", command_line));
    }
    if let Some(logs) = report.downcast_ref::<CapturedLogs>() {
        rendered.push_str("\nLogs:\n");
        rendered.push_str(&logs.0);
    }
    rendered
}
