//! External-command executor.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{ExecutionFailure, ExecutionOutput, ExecutionRequest, PipelineExecutor};
use crate::domain::FailureKind;

/// Result code an executor reports on success.
pub const SUCCESS_CODE: i64 = 200;

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Command timed out after {0}s")]
    Timeout(u64),

    #[error("Command failed with exit code: {0}")]
    Failed(i32),

    #[error("Command produced no output")]
    NoOutput,
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    }

    #[cfg(not(windows))]
    {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    }
}

/// Run `command` through the shell, write `input` as JSON to its stdin and
/// return the last non-empty stdout line.
///
/// A non-zero exit is only an error when nothing was printed; commands report
/// their own failures in the output line. The child is killed if the returned
/// future is dropped.
pub async fn run_json_command(
    command: &str,
    envs: &[(&str, String)],
    input: &Value,
    timeout_secs: u64,
) -> std::result::Result<String, CommandError> {
    let mut cmd = shell_command(command);
    cmd.envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(CommandError::Spawn)?;

    let stdout_handle = child.stdout.take().map(|stdout| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut last = None;
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("stdout: {}", line);
                if !line.trim().is_empty() {
                    last = Some(line);
                }
            }
            last
        })
    });

    let stderr_handle = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains("error") || line.contains("Error") {
                    warn!("stderr: {}", line);
                } else {
                    debug!("stderr: {}", line);
                }
            }
        })
    });

    if let Some(mut stdin) = child.stdin.take() {
        let mut body = input.to_string();
        body.push('\n');
        // Commands that ignore stdin close it early.
        if let Err(e) = stdin.write_all(body.as_bytes()).await {
            debug!("stdin write failed: {}", e);
        }
    }

    // A zero timeout waits for as long as the command runs.
    let waited = if timeout_secs == 0 {
        Ok(child.wait().await)
    } else {
        tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await
    };
    let status = match waited {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(CommandError::Wait(e)),
        Err(_) => {
            error!("Command timed out after {}s", timeout_secs);
            let _ = child.kill().await;
            return Err(CommandError::Timeout(timeout_secs));
        }
    };

    let last_line = match stdout_handle {
        Some(h) => h.await.ok().flatten(),
        None => None,
    };
    if let Some(h) = stderr_handle {
        let _ = h.await;
    }

    match last_line {
        Some(line) => Ok(line),
        None if !status.success() => Err(CommandError::Failed(status.code().unwrap_or(-1))),
        None => Err(CommandError::NoOutput),
    }
}

#[derive(Debug, Deserialize)]
struct ExecutorReply {
    code: i64,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    cookie: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Executor that runs a configured shell command for one pipeline kind.
///
/// The executor protocol: request JSON on stdin, account cookie in
/// `GENFLOW_COOKIE`, and a final stdout line
/// `{"code", "artifacts", "message", "cookie", "metadata"}`.
pub struct CommandExecutor {
    command: String,
    timeout_secs: u64,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_secs: 1800,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    fn request_body(request: &ExecutionRequest) -> Value {
        json!({
            "task_id": request.task_id,
            "kind": request.kind,
            "platform": request.platform,
            "payload": request.payload,
            "account": {
                "id": request.account_id,
                "identifier": request.account_identifier,
            },
            "output_dir": request.output_dir,
            "hide_window": request.hide_window,
        })
    }

    fn interpret(reply: ExecutorReply) -> std::result::Result<ExecutionOutput, ExecutionFailure> {
        let refreshed_cookie = reply.cookie.filter(|c| !c.trim().is_empty());
        if reply.code == SUCCESS_CODE {
            if reply.artifacts.is_empty() {
                return Err(ExecutionFailure::new(
                    FailureKind::GenerationFailed,
                    reply
                        .message
                        .unwrap_or_else(|| "generation finished without artifacts".into()),
                )
                .with_cookie(refreshed_cookie));
            }
            return Ok(ExecutionOutput {
                artifacts: reply.artifacts,
                metadata: reply.metadata,
                refreshed_cookie,
            });
        }

        let message = reply
            .message
            .unwrap_or_else(|| format!("executor returned code {}", reply.code));
        Err(ExecutionFailure::new(FailureKind::from_code(reply.code), message)
            .with_cookie(refreshed_cookie))
    }
}

#[async_trait]
impl PipelineExecutor for CommandExecutor {
    fn name(&self) -> &'static str {
        "CommandExecutor"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionOutput, ExecutionFailure> {
        let start = Instant::now();
        info!(task_id = %request.task_id, kind = %request.kind, "Executing command");

        let envs = [
            ("GENFLOW_COOKIE", request.cookie.clone()),
            (
                "GENFLOW_HIDE_WINDOW",
                if request.hide_window { "1" } else { "0" }.to_string(),
            ),
            ("GENFLOW_TASK_ID", request.task_id.clone()),
            (
                "GENFLOW_OUTPUT_DIR",
                request.output_dir.to_string_lossy().into_owned(),
            ),
        ];

        let line = run_json_command(
            &self.command,
            &envs,
            &Self::request_body(request),
            self.timeout_secs,
        )
        .await
        .map_err(|e| match e {
            CommandError::Timeout(_) => ExecutionFailure::new(FailureKind::Timeout, e.to_string()),
            other => ExecutionFailure::new(FailureKind::Other, other.to_string()),
        })?;

        let reply: ExecutorReply = serde_json::from_str(&line).map_err(|e| {
            ExecutionFailure::new(
                FailureKind::Other,
                format!("unreadable executor output '{}': {}", line, e),
            )
        })?;

        let result = Self::interpret(reply);
        info!(
            task_id = %request.task_id,
            success = result.is_ok(),
            "Command completed in {:.2}s",
            start.elapsed().as_secs_f64()
        );
        result
    }
}
