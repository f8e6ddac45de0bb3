//! Command execution boundary.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Result of running one job command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Process exit code. Zero means success.
    pub exit_code: i32,
    /// Captured error text; empty on success.
    pub error_text: String,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            error_text: String::new(),
        }
    }

    pub fn failure(exit_code: i32, error_text: impl Into<String>) -> Self {
        Self {
            exit_code,
            error_text: error_text.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs job commands.
///
/// Execution errors are reported as a non-zero outcome, never as `Err`, so
/// they go through the job's retry machinery.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: &str) -> ExecutionOutcome;
}

/// Runs commands through the platform shell.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    timeout: Option<Duration>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    fn command(command: &str) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn process_output(output: std::process::Output) -> ExecutionOutcome {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => ExecutionOutcome::success(),
            Some(code) => {
                let error_text = if stderr.is_empty() {
                    format!("exit code {}", code)
                } else {
                    stderr
                };
                ExecutionOutcome::failure(code, error_text)
            }
            None => {
                let error_text = if stderr.is_empty() {
                    "terminated by signal".to_string()
                } else {
                    format!("terminated by signal: {}", stderr)
                };
                ExecutionOutcome::failure(-1, error_text)
            }
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, command: &str) -> ExecutionOutcome {
        tracing::debug!(command, "Executing command");

        let mut cmd = Self::command(command);
        let output = cmd.output();
        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, output).await {
                Ok(result) => result,
                Err(_) => {
                    return ExecutionOutcome::failure(
                        -1,
                        format!("timed out after {}s", timeout.as_secs_f64()),
                    );
                }
            },
            None => output.await,
        };

        match result {
            Ok(output) => Self::process_output(output),
            Err(e) => ExecutionOutcome::failure(-1, format!("failed to spawn command: {}", e)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_success() {
        let outcome = ShellExecutor::new().execute("echo hello").await;
        assert!(outcome.is_success());
        assert!(outcome.error_text.is_empty());
    }

    #[tokio::test]
    async fn test_execute_failure_captures_stderr() {
        let outcome = ShellExecutor::new()
            .execute("echo 'disk full' >&2; exit 3")
            .await;
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.error_text, "disk full");
    }

    #[tokio::test]
    async fn test_execute_failure_without_stderr() {
        let outcome = ShellExecutor::new().execute("exit 7").await;
        assert_eq!(outcome.exit_code, 7);
        assert_eq!(outcome.error_text, "exit code 7");
    }

    #[tokio::test]
    async fn test_execute_unknown_command() {
        let outcome = ShellExecutor::new()
            .execute("definitely-not-a-command-queuectl")
            .await;
        assert!(!outcome.is_success());
        assert!(!outcome.error_text.is_empty());
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let outcome = ShellExecutor::with_timeout(Duration::from_millis(100))
            .execute("sleep 5")
            .await;
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.error_text.starts_with("timed out"));
    }
}
