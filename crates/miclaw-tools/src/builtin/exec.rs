// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::builtin::process::ProcessManager;
use crate::tool::{Tool, ToolCall, ToolResult};
use crate::truncate::{head_tail_truncate, OUTPUT_LIMIT_BYTES};

/// Exit code reported when a command exceeds its deadline (matches
/// coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const DEFAULT_TIMEOUT_SECS: u64 = 1800;
const MIN_TIMEOUT_SECS: u64 = 10;

/// Run a shell command and return combined stdout/stderr.
///
/// With `background: true` the command is handed to the process manager
/// and the call returns immediately with the process id; a tool built
/// without a manager (the sandbox child) rejects background requests.
pub struct ExecTool {
    pub workspace: PathBuf,
    pub manager: Option<Arc<ProcessManager>>,
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command (bash -c) and return stdout + stderr. \
         Output is capped at ~20 KB with head and tail preserved. A timed-out \
         command reports exit code 124. Set background=true to start a \
         long-running process and manage it with the 'process' tool."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to execute" },
                "workdir": { "type": "string", "description": "Working directory (default: workspace root)" },
                "timeout_secs": { "type": "integer", "description": "Deadline in seconds (default 1800, min 10)" },
                "background": { "type": "boolean", "description": "Run detached under the process manager" }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(command) = call.str_arg("command") else {
            return Ok(ToolResult::err(&call.id, "missing 'command'"));
        };
        let workdir = super::resolve(&self.workspace, call.str_arg("workdir").unwrap_or("."));
        let timeout = call
            .u64_arg("timeout_secs")
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .max(MIN_TIMEOUT_SECS);

        if call.bool_arg("background").unwrap_or(false) {
            let Some(manager) = &self.manager else {
                return Ok(ToolResult::err(
                    &call.id,
                    "background execution is not available here",
                ));
            };
            return Ok(match manager.start(command, &workdir) {
                Ok(id) => ToolResult::ok(
                    &call.id,
                    format!("started background process {id}; poll it with the 'process' tool"),
                ),
                Err(e) => ToolResult::err(&call.id, format!("spawn error: {e}")),
            });
        }

        debug!(cmd = %command, "exec tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        cmd.current_dir(&workdir);
        // No controlling terminal: stdin from /dev/null and a fresh session
        // so the child cannot reach the agent's tty; the timeout path drops
        // the future, and kill_on_drop reaps the child.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let result = tokio::time::timeout(Duration::from_secs(timeout), cmd.output()).await;
        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stdout.is_empty() {
                    content.push_str(&head_tail_truncate(&stdout, OUTPUT_LIMIT_BYTES));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&head_tail_truncate(&stderr, OUTPUT_LIMIT_BYTES));
                }
                let code = output.status.code().unwrap_or(-1);
                if code == 0 {
                    if content.is_empty() {
                        content = "[exit 0]".into();
                    }
                    Ok(ToolResult::ok(&call.id, content))
                } else {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(&format!("[exit {code}]"));
                    Ok(ToolResult::err(&call.id, content))
                }
            }
            Ok(Err(e)) => Ok(ToolResult::err(&call.id, format!("spawn error: {e}"))),
            Err(_) => Ok(ToolResult::err(
                &call.id,
                format!("command timed out after {timeout}s\n[exit {TIMEOUT_EXIT_CODE}]"),
            )),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(dir: &tempfile::TempDir) -> ExecTool {
        ExecTool {
            workspace: dir.path().to_path_buf(),
            manager: None,
        }
    }

    #[tokio::test]
    async fn captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new("1", "exec", json!({"command": "echo hi"})))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content.trim(), "hi");
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new("1", "exec", json!({"command": "exit 3"})))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("[exit 3]"));
    }

    #[tokio::test]
    async fn stderr_is_labeled() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new(
                "1",
                "exec",
                json!({"command": "echo oops 1>&2"}),
            ))
            .await
            .unwrap();
        assert!(out.content.contains("[stderr]"));
        assert!(out.content.contains("oops"));
    }

    #[tokio::test]
    async fn runs_in_requested_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new(
                "1",
                "exec",
                json!({"command": "pwd", "workdir": "sub"}),
            ))
            .await
            .unwrap();
        assert!(out.content.trim().ends_with("/sub"));
    }

    #[tokio::test]
    async fn background_without_manager_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new(
                "1",
                "exec",
                json!({"command": "sleep 60", "background": true}),
            ))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("not available"));
    }
}
