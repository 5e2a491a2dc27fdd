//! The process boundary of CAN decoding.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};

/// What a finished decoder run reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Captured output, truncated to the configured cap.
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
}

/// Something that turns a raw CAN log into its decoded sibling artifact.
pub trait DecoderBackend: Send + Sync {
    fn decode<'a>(
        &'a self,
        source: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<BackendOutput>>;

    fn name(&self) -> &str;
}

/// Runs the configured program with the source path appended to its args.
///
/// The launcher stops the child at `timeout`. A separate watchdog task fires
/// at `timeout + kill_grace` and unblocks every remaining wait, so a child
/// that ignores the kill or a grandchild holding the pipes open cannot stall
/// the caller.
#[derive(Debug, Clone)]
pub struct SubprocessDecoder {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    kill_grace: Duration,
    output_cap_bytes: usize,
}

impl SubprocessDecoder {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(5),
            output_cap_bytes: 64 * 1024,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration, kill_grace: Duration) -> Self {
        self.timeout = timeout;
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_output_cap(mut self, bytes: usize) -> Self {
        self.output_cap_bytes = bytes;
        self
    }

    async fn run(&self, source: &Path, cancel: &CancellationToken) -> Result<BackendOutput> {
        let started = Instant::now();
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args)
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| IngestError::Decoding {
            path: source.to_path_buf(),
            reason: format!("failed to launch {}: {}", self.program.display(), e),
            transient: false,
        })?;

        let kill_switch = CancellationToken::new();
        let watchdog = {
            let kill_switch = kill_switch.clone();
            let limit = self.timeout + self.kill_grace;
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                kill_switch.cancel();
            })
        };

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_capped(out, self.output_cap_bytes, kill_switch.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_capped(err, self.output_cap_bytes, kill_switch.clone())));

        enum Ending {
            Exited(std::process::ExitStatus),
            TimedOut,
            Cancelled,
        }

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(
                status.map_err(|e| IngestError::io(source, e))?,
            ),
            _ = tokio::time::sleep(self.timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        if !matches!(ending, Ending::Exited(_)) {
            if let Err(e) = child.start_kill() {
                log::debug!("Decoder process already gone: {}", e);
            }
            tokio::select! {
                _ = child.wait() => {}
                _ = kill_switch.cancelled() => {
                    log::error!(
                        "Decoder {} did not exit after kill; abandoning it",
                        self.program.display()
                    );
                }
            }
        }

        let stdout = join_output(stdout).await;
        let stderr = join_output(stderr).await;
        watchdog.abort();
        let elapsed = started.elapsed();

        match ending {
            Ending::Exited(status) => Ok(BackendOutput {
                exit_code: status.code(),
                success: status.success(),
                stdout,
                stderr,
                elapsed_ms: elapsed.as_millis() as u64,
            }),
            Ending::TimedOut => {
                log::warn!(
                    "Decoder timed out after {}ms on {}",
                    elapsed.as_millis(),
                    source.display()
                );
                Err(IngestError::Timeout {
                    operation: format!("decode {}", source.display()),
                    elapsed_ms: elapsed.as_millis() as u64,
                })
            }
            Ending::Cancelled => Err(IngestError::Cancelled(format!(
                "decode of {} cancelled",
                source.display()
            ))),
        }
    }
}

impl DecoderBackend for SubprocessDecoder {
    fn decode<'a>(
        &'a self,
        source: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<BackendOutput>> {
        Box::pin(self.run(source, cancel))
    }

    fn name(&self) -> &str {
        "subprocess"
    }
}

/// Drains `reader`, keeping at most `cap` bytes. Keeps reading past the cap
/// so the child never blocks on a full pipe.
async fn read_capped<R>(mut reader: R, cap: usize, kill_switch: CancellationToken) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = kill_switch.cancelled() => break,
        };
        let room = cap.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    String::from_utf8_lossy(&kept).into_owned()
}

async fn join_output(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}
