//! Allow-listed external tool invocation.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Liveness;
use crate::error::{PluginError, PluginResult};

/// Captured output is truncated beyond this many bytes per stream.
const MAX_CAPTURE_BYTES: u64 = 16 * 1024 * 1024;

/// Result of a completed tool run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutput {
    /// Exit code, `None` if killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    /// Exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Standard output as lossy UTF-8.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as lossy UTF-8.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs allow-listed programs with a hard wall-clock ceiling.
///
/// Programs are named bare (`strings`, never `/usr/bin/strings`) and
/// resolved on `PATH`. The child runs in the plugin working directory with
/// an environment holding only `PATH`, no stdin, and is killed when the
/// ceiling passes, the caller cancels, or the invoking future is dropped.
#[derive(Debug, Clone)]
pub struct RestrictedProcessInvoker {
    allowed: Arc<BTreeSet<String>>,
    working_dir: PathBuf,
    ceiling: Duration,
    liveness: Liveness,
}

impl RestrictedProcessInvoker {
    pub(crate) fn new(
        allowed: BTreeSet<String>,
        working_dir: PathBuf,
        ceiling: Duration,
        liveness: Liveness,
    ) -> Self {
        Self {
            allowed: Arc::new(allowed),
            working_dir,
            ceiling,
            liveness,
        }
    }

    /// Programs this invoker may run.
    #[must_use]
    pub fn allowed_programs(&self) -> &BTreeSet<String> {
        &self.allowed
    }

    /// Wall-clock ceiling per invocation.
    #[must_use]
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Run `program` with `args`.
    ///
    /// A non-zero exit is not an error; inspect [`ProcessOutput::exit_code`].
    ///
    /// # Errors
    ///
    /// - [`PluginError::ResourceDenied`] for a path, a program outside the
    ///   allow-list, or one missing from `PATH`
    /// - [`PluginError::ProcessTimeout`] when the ceiling passes
    /// - [`PluginError::Cancelled`] when `cancel` fires
    /// - [`PluginError::Io`] if the process cannot be spawned
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> PluginResult<ProcessOutput> {
        self.liveness.check(program)?;

        if program.is_empty() || program.contains(['/', '\\']) {
            return Err(PluginError::denied(
                program,
                "programs must be named without a path",
            ));
        }
        if !self.allowed.contains(program) {
            return Err(PluginError::denied(
                program,
                "program is not in the plugin's allow-list",
            ));
        }
        let lookup = program.to_string();
        let resolved = tokio::task::spawn_blocking(move || which::which(lookup))
            .await
            .map_err(|e| PluginError::ExecutionFailure(format!("PATH lookup failed: {e}")))?
            .map_err(|_| PluginError::denied(program, "program not found on PATH"))?;

        let mut command = tokio::process::Command::new(&resolved);
        command
            .args(args)
            .current_dir(&self.working_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let mut child = command.spawn()?;
        let stdout = tokio::spawn(capture(child.stdout.take()));
        let stderr = tokio::spawn(capture(child.stderr.take()));
        debug!(program, args = ?args, "Spawned plugin tool");

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            () = tokio::time::sleep(self.ceiling) => Outcome::TimedOut,
            () = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = status?;
                Ok(ProcessOutput {
                    exit_code: status.code(),
                    stdout: collect(stdout).await?,
                    stderr: collect(stderr).await?,
                })
            },
            Outcome::TimedOut => {
                warn!(program, ceiling = ?self.ceiling, "Killing plugin tool after ceiling");
                kill(&mut child, program).await;
                Err(PluginError::ProcessTimeout {
                    program: program.to_string(),
                    after: self.ceiling,
                })
            },
            Outcome::Cancelled => {
                kill(&mut child, program).await;
                Err(PluginError::Cancelled(format!("process '{program}'")))
            },
        }
    }
}

async fn kill(child: &mut tokio::process::Child, program: &str) {
    if let Err(e) = child.kill().await {
        warn!(program, error = %e, "Failed to kill plugin tool");
    }
}

/// Read up to [`MAX_CAPTURE_BYTES`], then keep draining so the child never
/// stalls on a full pipe.
async fn capture<R: AsyncRead + Unpin>(stream: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let Some(mut stream) = stream else {
        return Ok(buf);
    };
    (&mut stream)
        .take(MAX_CAPTURE_BYTES)
        .read_to_end(&mut buf)
        .await?;
    let discarded = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await?;
    if discarded > 0 {
        debug!(discarded, "Truncated plugin tool output");
    }
    Ok(buf)
}

async fn collect(task: JoinHandle<std::io::Result<Vec<u8>>>) -> PluginResult<Vec<u8>> {
    match task.await {
        Ok(output) => Ok(output?),
        Err(join) => Err(PluginError::ExecutionFailure(format!(
            "output capture failed: {join}"
        ))),
    }
}
