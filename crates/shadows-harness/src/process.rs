use std::io::ErrorKind;
use std::process::Stdio;

use error_stack::Report;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::HarnessConfig;
use crate::errors::{CommandLine, HarnessError, HarnessErrorExt, HarnessResult};
use crate::logging::LogCtx;

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One read from the node's stdout or stderr, as delivered by the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub source: OutputSource,
    pub bytes: Vec<u8>,
}

impl LogChunk {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Writes the chunk to the harness's own stream of the same kind.
    pub fn echo(&self) {
        match self.source {
            OutputSource::Stdout => println!("{}", self.text()),
            OutputSource::Stderr => eprintln!("{}", self.text()),
        }
    }
}

/// Output accumulated while waiting for readiness, kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBuffer {
    chunks: Vec<String>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: String) {
        self.chunks.push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn render(&self) -> String {
        self.chunks.join("\n")
    }
}

/// Merged stdout/stderr of a running node.
///
/// The stream ends once both pipes are closed.
#[derive(Debug)]
pub struct LogStream {
    receiver: UnboundedReceiver<LogChunk>,
}

impl LogStream {
    pub fn channel() -> (UnboundedSender<LogChunk>, LogStream) {
        let (sender, receiver) = unbounded_channel();
        (sender, LogStream { receiver })
    }

    pub async fn next_chunk(&mut self) -> Option<LogChunk> {
        self.receiver.recv().await
    }

    /// Hands the rest of the stream to a background task that echoes it, or
    /// discards it, so the node never blocks on a full pipe.
    pub fn detach(mut self, display_log: bool) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(chunk) = self.receiver.recv().await {
                if display_log {
                    chunk.echo();
                }
            }
        })
    }
}

/// Handle on the spawned node.
#[derive(Debug)]
pub struct NodeProcess {
    child: Option<Child>,
    pid: Option<u32>,
    command_line: CommandLine,
}

impl NodeProcess {
    /// Starts the node described by `config` with both output pipes captured.
    pub fn spawn(config: &HarnessConfig, ctx: &LogCtx) -> HarnessResult<(NodeProcess, LogStream)> {
        let command_line = config.command_line();
        ctx.try_log(|logger| info!(logger, "Spawning {}", command_line));

        let mut child = Command::new(config.binary_path())
            .args(config.spawn_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let kind = match e.kind() {
                    ErrorKind::NotFound => HarnessError::BinaryNotFound,
                    _ => HarnessError::SpawnFailed,
                };
                Report::new(e).change_context(kind)
            })
            .with_command_line(command_line.clone())?;

        let (sender, stream) = LogStream::channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputSource::Stdout, sender.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputSource::Stderr, sender));
        }

        let pid = child.id();
        ctx.try_log(|logger| debug!(logger, "Node started with pid {:?}", pid));
        Ok((NodeProcess { child: Some(child), pid, command_line }, stream))
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn command_line(&self) -> &CommandLine {
        &self.command_line
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminates the node and reaps it. A process that already exited, or a
    /// second call, is a no-op; failures are logged, not returned.
    pub async fn kill(&mut self, ctx: &LogCtx) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                ctx.try_log(|logger| debug!(logger, "Node already exited ({})", status));
                return;
            }
            Ok(None) => {}
            Err(e) => ctx.try_log(|logger| warn!(logger, "Unable to poll node status: {}", e)),
        }
        if let Err(e) = child.kill().await {
            ctx.try_log(|logger| warn!(logger, "Unable to kill node {:?}: {}", self.pid, e));
        }
    }
}

async fn pump<R>(mut pipe: R, source: OutputSource, sender: UnboundedSender<LogChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            // keep draining after the receiver is gone
            Ok(n) => {
                let _ = sender.send(LogChunk { source, bytes: buffer[..n].to_vec() });
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::sh_node;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let config = HarnessConfig::builder()
            .binary_path("/nonexistent/shadows-node")
            .without_types_bundle()
            .build()
            .unwrap();
        let err = NodeProcess::spawn(&config, &LogCtx::empty()).unwrap_err();
        assert_eq!(err.current_context(), &HarnessError::BinaryNotFound);
        let command_line = err.downcast_ref::<CommandLine>().unwrap();
        assert_eq!(command_line.program, "/nonexistent/shadows-node");
    }

    #[tokio::test]
    async fn test_streams_are_merged() {
        let config = sh_node("echo out; echo err 1>&2").build().unwrap();
        let (mut process, mut stream) = NodeProcess::spawn(&config, &LogCtx::empty()).unwrap();

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = stream.next_chunk().await {
            match chunk.source {
                OutputSource::Stdout => stdout.push_str(&chunk.text()),
                OutputSource::Stderr => stderr.push_str(&chunk.text()),
            }
        }
        assert_eq!(stdout.trim(), "out");
        assert_eq!(stderr.trim(), "err");
        process.kill(&LogCtx::empty()).await;
    }

    #[tokio::test]
    async fn test_kill_twice_is_a_no_op() {
        let config = sh_node("sleep 30").build().unwrap();
        let (mut process, _stream) = NodeProcess::spawn(&config, &LogCtx::empty()).unwrap();
        assert!(process.id().is_some());
        assert_eq!(process.command_line().program, "/bin/sh");
        assert!(process.is_running());

        process.kill(&LogCtx::empty()).await;
        assert!(!process.is_running());
        process.kill(&LogCtx::empty()).await;
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_a_no_op() {
        let config = sh_node("exit 0").build().unwrap();
        let (mut process, mut stream) = NodeProcess::spawn(&config, &LogCtx::empty()).unwrap();
        while stream.next_chunk().await.is_some() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        process.kill(&LogCtx::empty()).await;
        assert!(!process.is_running());
    }

    #[test]
    fn test_log_buffer_render() {
        let mut buffer = LogBuffer::new();
        buffer.push("first".into());
        buffer.push("second".into());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.render(), "first\nsecond");
    }
}
