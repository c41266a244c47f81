//! Shell exec tool — run a command under `sh -c` with a hard timeout and
//! cooperative cancellation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use fm_domain::cancel::CancelToken;
use fm_domain::message::ToolDefinition;

use crate::{Tool, ToolOutcome};

const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct ExecRequest {
    command: String,
    /// Override the default timeout (seconds).
    #[serde(default)]
    timeout_secs: Option<u64>,
}

pub struct ShellExec {
    pub workdir: PathBuf,
    pub default_timeout_secs: u64,
}

#[async_trait::async_trait]
impl Tool for ShellExec {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "shell:exec".into(),
            description: "Run a shell command in the workspace and return stdout, stderr and the exit code.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_secs": {"type": "integer"}
                },
                "required": ["command"]
            }),
        }
    }

    async fn execute(&self, input: Value, cancel: &CancelToken) -> ToolOutcome {
        let req: ExecRequest = match serde_json::from_value(input) {
            Ok(r) => r,
            Err(e) => return ToolOutcome::fail("invalid_args", format!("bad tool arguments: {e}")),
        };
        if cancel.is_cancelled() {
            return ToolOutcome::fail("cancelled", "run was cancelled before the command started");
        }

        let timeout = Duration::from_secs(req.timeout_secs.unwrap_or(self.default_timeout_secs));

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&req.command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutcome::fail("spawn_failed", format!("{}: {e}", req.command)),
        };

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolOutcome::fail("exec_failed", e.to_string()),
            Err(_) => {
                return ToolOutcome::fail(
                    "timeout",
                    format!("command exceeded {}s: {}", timeout.as_secs(), req.command),
                );
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr));

        let payload = json!({
            "command": req.command,
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        });
        let metadata = json!({"command": req.command, "exit_code": exit_code});

        if output.status.success() {
            ToolOutcome::ok(payload).with_metadata(metadata)
        } else {
            ToolOutcome {
                success: false,
                output: Some(payload),
                error: Some(crate::ToolError::new(
                    "nonzero_exit",
                    format!("command exited with status {exit_code}"),
                )),
                metadata: Some(metadata),
            }
        }
    }
}

fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_CAPTURED_OUTPUT {
        return s.to_string();
    }
    let mut end = MAX_CAPTURED_OUTPUT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... truncated", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(timeout: u64) -> (tempfile::TempDir, ShellExec) {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().to_path_buf();
        (dir, ShellExec { workdir, default_timeout_secs: timeout })
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let (_guard, shell) = tool(10);
        let out = shell
            .execute(json!({"command": "echo hello"}), &CancelToken::new())
            .await;
        assert!(out.success);
        let payload = out.output.unwrap();
        assert_eq!(payload["exit_code"], 0);
        assert_eq!(payload["stdout"].as_str().unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_tool_failure_with_output() {
        let (_guard, shell) = tool(10);
        let out = shell
            .execute(json!({"command": "echo oops >&2; exit 3"}), &CancelToken::new())
            .await;
        assert!(!out.success);
        let payload = out.output.unwrap();
        assert_eq!(payload["exit_code"], 3);
        assert!(payload["stderr"].as_str().unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let (_guard, shell) = tool(1);
        let out = shell
            .execute(json!({"command": "sleep 30"}), &CancelToken::new())
            .await;
        assert!(!out.success);
        assert_eq!(out.error.unwrap().code, "timeout");
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let (_guard, shell) = tool(10);
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = shell.execute(json!({"command": "echo x"}), &cancel).await;
        assert_eq!(out.error.unwrap().code, "cancelled");
    }
}
