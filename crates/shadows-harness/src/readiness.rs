//! Readiness detection over the node's unstructured output.
//!
//! The detector resolves exactly once: either a chunk matched the marker, the
//! deadline fired, or the node closed both pipes. The deadline is raced
//! against the scan and the warm-up call with a biased `select!`, so once it
//! has fired neither a late match nor a late warm-up answer is observed.

use std::time::{Duration, Instant};

use error_stack::ResultExt;
use regex::Regex;

use crate::config::HarnessConfig;
use crate::errors::{CommandLine, HarnessError, HarnessErrorExt, HarnessResult};
use crate::eth::EthRpc;
use crate::logging::LogCtx;
use crate::process::{LogBuffer, LogStream};

/// Terminal outcome of a readiness wait.
#[derive(Debug)]
pub enum Readiness {
    Ready { elapsed: Duration, buffer: LogBuffer },
    TimedOut { buffer: LogBuffer },
    Exited { buffer: LogBuffer },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }

    pub fn buffer(&self) -> &LogBuffer {
        match self {
            Readiness::Ready { buffer, .. }
            | Readiness::TimedOut { buffer }
            | Readiness::Exited { buffer } => buffer,
        }
    }

    /// Maps a failed wait to its fatal error, carrying the command line and
    /// everything the node printed.
    pub fn into_result(self, command_line: &CommandLine) -> HarnessResult<LogBuffer> {
        let (kind, buffer) = match self {
            Readiness::Ready { buffer, .. } => return Ok(buffer),
            Readiness::TimedOut { buffer } => (HarnessError::ReadinessTimeout, buffer),
            Readiness::Exited { buffer } => (HarnessError::NodeExited, buffer),
        };
        Err(harness_error!(kind, "readiness marker not seen"))
            .with_command_line(command_line.clone())
            .with_captured_logs(buffer.render())
    }
}

enum ScanOutcome {
    Matched,
    Closed,
}

pub struct ReadinessDetector<'a> {
    marker: &'a Regex,
    window: Duration,
    display_log: bool,
    warmup: Option<&'a EthRpc>,
}

impl<'a> ReadinessDetector<'a> {
    pub fn new(marker: &'a Regex, window: Duration) -> Self {
        Self { marker, window, display_log: false, warmup: None }
    }

    pub fn for_config(config: &'a HarnessConfig) -> Self {
        Self::new(config.ready_marker(), config.detection_window()).display_log(config.display_log())
    }

    /// Issues one `eth_chainId` through `client` once the marker matched, so
    /// the node initializes its EVM path before any timed test runs.
    pub fn with_warmup(mut self, client: Option<&'a EthRpc>) -> Self {
        self.warmup = client;
        self
    }

    pub fn display_log(mut self, display_log: bool) -> Self {
        self.display_log = display_log;
        self
    }

    /// Waits for the marker. Only a failing warm-up call is an error; every
    /// other outcome is reported through [`Readiness`].
    pub async fn await_ready(&self, stream: &mut LogStream, ctx: &LogCtx) -> HarnessResult<Readiness> {
        let started = Instant::now();
        let mut buffer = LogBuffer::new();
        let deadline = tokio::time::sleep(self.window);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            biased;
            _ = &mut deadline => None,
            scanned = self.scan_and_warm_up(stream, &mut buffer, ctx) => Some(scanned),
        };

        match outcome {
            None => {
                ctx.try_log(|logger| {
                    warn!(logger, "No readiness marker after {} ms", self.window.as_millis())
                });
                Ok(Readiness::TimedOut { buffer })
            }
            Some(Err(report)) => Err(report).with_captured_logs(buffer.render()),
            Some(Ok(ScanOutcome::Closed)) => {
                ctx.try_log(|logger| warn!(logger, "Node output closed before readiness"));
                Ok(Readiness::Exited { buffer })
            }
            Some(Ok(ScanOutcome::Matched)) => {
                let elapsed = started.elapsed();
                ctx.try_log(|logger| info!(logger, "Node ready in {} ms", elapsed.as_millis()));
                Ok(Readiness::Ready { elapsed, buffer })
            }
        }
    }

    /// The warm-up call runs inside the same deadline as the scan.
    async fn scan_and_warm_up(
        &self,
        stream: &mut LogStream,
        buffer: &mut LogBuffer,
        ctx: &LogCtx,
    ) -> HarnessResult<ScanOutcome> {
        let outcome = self.scan(stream, buffer).await;
        if let (ScanOutcome::Matched, Some(client)) = (&outcome, self.warmup) {
            let chain_id = client.chain_id().await.change_context(HarnessError::WarmupFailed)?;
            ctx.try_log(|logger| debug!(logger, "Warm-up chain id {}", chain_id));
        }
        Ok(outcome)
    }

    async fn scan(&self, stream: &mut LogStream, buffer: &mut LogBuffer) -> ScanOutcome {
        while let Some(chunk) = stream.next_chunk().await {
            if self.display_log {
                chunk.echo();
            }
            let text = chunk.text();
            let matched = self.marker.is_match(&text);
            buffer.push(text);
            if matched {
                return ScanOutcome::Matched;
            }
        }
        ScanOutcome::Closed
    }
}
