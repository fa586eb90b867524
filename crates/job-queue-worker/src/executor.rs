use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Exit status the shell reports when it cannot find the command
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// How long to keep reading pipes after the command has exited
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Why an execution did not succeed. The display text is what gets recorded
/// as the job's `error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    #[error("Job timed out")]
    Timeout,

    #[error("Command not found")]
    CommandNotFound,

    #[error("{message}")]
    NonZeroExit { code: i32, message: String },

    #[error("Failed to start command: {0}")]
    Spawn(String),
}

/// Captured result of running one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub failure: Option<ExecutionFailure>,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    fn failed(failure: ExecutionFailure) -> Self {
        ExecutionOutcome {
            failure: Some(failure),
            ..Default::default()
        }
    }
}

/// Runs a job's command line
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command`, killing it once `limit` has elapsed
    async fn execute(&self, command: &str, limit: Duration) -> ExecutionOutcome;
}

/// Executes commands through `sh -c` as child processes
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        ShellExecutor {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        ShellExecutor {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str, limit: Duration) -> ExecutionOutcome {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own process group so a timeout takes the whole pipeline down
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Shell {:?} not found", self.shell);
                return ExecutionOutcome::failed(ExecutionFailure::CommandNotFound);
            }
            Err(e) => return ExecutionOutcome::failed(ExecutionFailure::Spawn(e.to_string())),
        };
        let pid = child.id();

        // drain both pipes independently so a timeout keeps what was written
        let stdout = tokio::spawn(read_stream(child.stdout.take()));
        let stderr = tokio::spawn(read_stream(child.stderr.take()));

        let status = match timeout(limit, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => return ExecutionOutcome::failed(ExecutionFailure::Spawn(e.to_string())),
            Err(_) => {
                debug!("Command exceeded {:?}, killing process group", limit);
                if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
                    // the group may already be gone
                    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
                }
                if let Err(e) = child.wait().await {
                    warn!("Failed to reap timed out command: {}", e);
                }
                None
            }
        };

        let stdout = collect_stream(stdout).await;
        let stderr = collect_stream(stderr).await;
        match status {
            Some(status) => classify(status, stdout, stderr),
            None => ExecutionOutcome {
                stdout,
                stderr,
                failure: Some(ExecutionFailure::Timeout),
            },
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!("Stopped reading command output: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Wait for a pipe reader. A background process that escaped the group can
/// keep the pipe open, so the wait is bounded.
async fn collect_stream(reader: JoinHandle<String>) -> String {
    match timeout(DRAIN_LIMIT, reader).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            warn!("Command output still open after exit, discarding it");
            String::new()
        }
    }
}

/// Map an exit status and captured streams to an outcome
pub fn classify(status: ExitStatus, stdout: String, stderr: String) -> ExecutionOutcome {
    let failure = if status.success() {
        None
    } else {
        Some(match status.code() {
            // terminated by a signal
            None => ExecutionFailure::Timeout,
            Some(EXIT_COMMAND_NOT_FOUND) => ExecutionFailure::CommandNotFound,
            Some(code) => {
                let message = if stderr.trim().is_empty() {
                    format!("Command failed with exit code {code}")
                } else {
                    stderr.trim().to_string()
                };
                ExecutionFailure::NonZeroExit { code, message }
            }
        })
    };

    ExecutionOutcome {
        stdout,
        stderr,
        failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    const LIMIT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_executor_success() {
        let outcome = ShellExecutor::new().execute("echo hello", LIMIT).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stdout, "hello\n");
        assert!(outcome.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_exit_uses_stderr() {
        let outcome = ShellExecutor::new()
            .execute("echo broken >&2; exit 3", LIMIT)
            .await;
        assert_eq!(
            outcome.failure,
            Some(ExecutionFailure::NonZeroExit {
                code: 3,
                message: "broken".to_string()
            })
        );
        assert_eq!(outcome.failure.unwrap().to_string(), "broken");
    }

    #[tokio::test]
    async fn test_non_zero_exit_without_stderr() {
        let outcome = ShellExecutor::new().execute("exit 4", LIMIT).await;
        assert_eq!(
            outcome.failure.unwrap().to_string(),
            "Command failed with exit code 4"
        );
    }

    #[tokio::test]
    async fn test_command_not_found() {
        let outcome = ShellExecutor::new()
            .execute("definitely-not-a-real-command-4242", LIMIT)
            .await;
        assert_eq!(outcome.failure, Some(ExecutionFailure::CommandNotFound));
        assert_eq!(outcome.failure.unwrap().to_string(), "Command not found");
    }

    #[tokio::test]
    async fn test_missing_shell_is_command_not_found() {
        let outcome = ShellExecutor::with_shell("/nonexistent/sh")
            .execute("true", LIMIT)
            .await;
        assert_eq!(outcome.failure, Some(ExecutionFailure::CommandNotFound));
    }

    #[tokio::test]
    async fn test_executor_timeout() {
        let started = std::time::Instant::now();
        let outcome = ShellExecutor::new()
            .execute("sleep 5", Duration::from_millis(200))
            .await;
        assert_eq!(outcome.failure, Some(ExecutionFailure::Timeout));
        assert_eq!(outcome.failure.unwrap().to_string(), "Job timed out");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let outcome = ShellExecutor::new()
            .execute("echo partial; echo warn >&2; sleep 5", Duration::from_millis(300))
            .await;
        assert_eq!(outcome.failure, Some(ExecutionFailure::Timeout));
        assert_eq!(outcome.stdout, "partial\n");
        assert_eq!(outcome.stderr, "warn\n");
    }

    #[test]
    fn test_signal_termination_classified_as_timeout() {
        // raw wait status for SIGKILL
        let outcome = classify(ExitStatus::from_raw(9), String::new(), String::new());
        assert_eq!(outcome.failure, Some(ExecutionFailure::Timeout));
    }
}
