use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{OutputStream, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Ok => "ok",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one command
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn into_report(self) -> RunReport {
        RunReport {
            status: self.status.as_str().to_string(),
            exit_code: self.exit_code,
            error: self.error,
        }
    }
}

/// Runs commands through a shell and streams their output line by line.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
}

impl CommandExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Run `command` as `<shell> -c <command>`. Every output line is sent to
    /// `output` as it is read. The process is killed if `cancel` fires or
    /// `timeout` passes first.
    pub async fn execute(
        &self,
        job_id: Uuid,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
        output: mpsc::Sender<(OutputStream, String)>,
    ) -> ExecutionResult {
        tracing::info!(job_id = %job_id, command, "Executing job");

        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to start command");
                return ExecutionResult {
                    job_id,
                    status: ExecutionStatus::Failed,
                    exit_code: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                OutputStream::Stdout,
                output.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                OutputStream::Stderr,
                output.clone(),
            )));
        }
        drop(output);

        let result = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => ExecutionResult {
                    job_id,
                    status: ExecutionStatus::Ok,
                    exit_code: status.code(),
                    error: None,
                },
                Ok(status) => ExecutionResult {
                    job_id,
                    status: ExecutionStatus::Failed,
                    exit_code: status.code(),
                    error: Some(match status.code() {
                        Some(code) => format!("Exit code: {}", code),
                        None => "Terminated by signal".to_string(),
                    }),
                },
                Err(e) => ExecutionResult {
                    job_id,
                    status: ExecutionStatus::Failed,
                    exit_code: None,
                    error: Some(e.to_string()),
                },
            },
            _ = cancel.cancelled() => {
                kill(&mut child, job_id).await;
                ExecutionResult {
                    job_id,
                    status: ExecutionStatus::Cancelled,
                    exit_code: None,
                    error: Some("cancelled".to_string()),
                }
            }
            _ = tokio::time::sleep(timeout) => {
                kill(&mut child, job_id).await;
                ExecutionResult {
                    job_id,
                    status: ExecutionStatus::TimedOut,
                    exit_code: None,
                    error: Some(format!("timed out after {:?}", timeout)),
                }
            }
        };

        // Drain whatever the process wrote before it exited
        for reader in readers {
            let _ = reader.await;
        }

        tracing::info!(
            job_id = %job_id,
            status = %result.status,
            exit_code = ?result.exit_code,
            "Job completed"
        );
        result
    }
}

async fn kill(child: &mut tokio::process::Child, job_id: Uuid) {
    if let Err(e) = child.kill().await {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to kill command");
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, output: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(mut line)) => {
                line.push('\n');
                if output.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "Failed to read command output");
                break;
            }
        }
    }
}
