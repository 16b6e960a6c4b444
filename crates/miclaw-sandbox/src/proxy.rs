// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use miclaw_tools::{Tool, ToolCall, ToolRegistry, ToolResult, BRIDGEABLE_TOOLS, PROCESS_TOOL};

use crate::container::SANDBOX_BINARY_PATH;

/// Proxy that runs a bridgeable tool inside the sandbox container.
///
/// The call is marshaled as JSON, base64-encoded, and handed to the same
/// binary inside the container via `--tool-call`; the child prints exactly
/// one JSON [`ToolResult`] on stdout.  A non-zero exit or unparseable
/// output is an infrastructure error, which the agent converts into an
/// error tool result.
pub struct BridgedTool {
    name: String,
    description: String,
    parameters: Value,
    container_id: String,
}

#[async_trait]
impl Tool for BridgedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        // Background exec would outlive the docker exec and leak a process
        // tree into the container; reject before forwarding.
        if self.name == "exec" && call.bool_arg("background").unwrap_or(false) {
            return Ok(ToolResult::err(
                &call.id,
                "background execution is not available in the sandbox",
            ));
        }

        let payload = serde_json::to_vec(call).context("marshal tool call")?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
        debug!(tool = %self.name, container = %self.container_id, "bridging tool call");

        let output = Command::new("docker")
            .args([
                "exec",
                &self.container_id,
                SANDBOX_BINARY_PATH,
                "--tool-call",
                &encoded,
            ])
            .output()
            .await
            .context("docker exec failed to spawn")?;

        if !output.status.success() {
            bail!(
                "sandbox tool {} exited with {:?}: {}",
                self.name,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result: ToolResult = serde_json::from_str(stdout.trim())
            .with_context(|| format!("sandbox tool {} printed invalid result", self.name))?;
        Ok(result)
    }
}

/// Substitute every bridgeable tool with its container proxy and drop the
/// `process` tool.  In-process tools pass through unchanged.
pub fn wrap_for_sandbox(registry: ToolRegistry, container_id: &str) -> ToolRegistry {
    let mut wrapped = ToolRegistry::new();
    for tool in registry.into_tools() {
        let name = tool.name().to_string();
        if name == PROCESS_TOOL {
            warn!("dropping '{PROCESS_TOOL}' tool: sandbox is active");
            continue;
        }
        if BRIDGEABLE_TOOLS.contains(&name.as_str()) {
            wrapped.register(BridgedTool {
                description: tool.description().to_string(),
                parameters: tool.parameters(),
                name,
                container_id: container_id.to_string(),
            });
        } else {
            wrapped.register_arc(tool);
        }
    }
    wrapped
}

/// Child-process mode: decode the call, run it against the bridgeable
/// toolset, print exactly one JSON result on stdout.  Returns the process
/// exit code.
pub async fn run_tool_call_child(encoded: &str, workspace: std::path::PathBuf) -> i32 {
    let registry = child_registry(workspace);
    let result = execute_encoded(encoded, &registry).await;
    match result {
        Ok(result) => {
            // Stdout carries exactly the result JSON, nothing else.
            match serde_json::to_string(&result) {
                Ok(json) => {
                    println!("{json}");
                    0
                }
                Err(e) => {
                    eprintln!("failed to serialize tool result: {e}");
                    1
                }
            }
        }
        Err(e) => {
            eprintln!("tool-call child failed: {e:#}");
            1
        }
    }
}

async fn execute_encoded(encoded: &str, registry: &ToolRegistry) -> anyhow::Result<ToolResult> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("tool call is not valid base64")?;
    let call: ToolCall = serde_json::from_slice(&bytes).context("tool call is not valid JSON")?;
    registry.execute(&call).await
}

/// The toolset available inside the container: bridgeable tools only.
fn child_registry(workspace: std::path::PathBuf) -> ToolRegistry {
    use miclaw_tools::{
        EditFileTool, ExecTool, GlobTool, GrepTool, ListDirTool, ReadFileTool, WriteFileTool,
    };
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool {
        workspace: workspace.clone(),
    });
    registry.register(WriteFileTool {
        workspace: workspace.clone(),
    });
    registry.register(EditFileTool {
        workspace: workspace.clone(),
    });
    registry.register(GrepTool {
        workspace: workspace.clone(),
    });
    registry.register(GlobTool {
        workspace: workspace.clone(),
    });
    registry.register(ListDirTool {
        workspace: workspace.clone(),
    });
    registry.register(ExecTool {
        workspace,
        manager: None,
    });
    registry
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Passthrough {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for Passthrough {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::ok(&call.id, "local"))
        }
    }

    fn registry_with(names: &[&'static str]) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        for name in names {
            reg.register(Passthrough { name });
        }
        reg
    }

    #[test]
    fn wrapping_substitutes_drops_and_passes_through() {
        let reg = registry_with(&["read", "process", "message"]);
        let wrapped = wrap_for_sandbox(reg, "cid123");
        // read proxied, process dropped, message unchanged.
        assert_eq!(wrapped.len(), 2);
        assert!(wrapped.get("read").is_some());
        assert!(wrapped.get("process").is_none());
        assert!(wrapped.get("message").is_some());
    }

    #[tokio::test]
    async fn passthrough_tool_still_runs_locally() {
        let reg = registry_with(&["message"]);
        let wrapped = wrap_for_sandbox(reg, "cid123");
        let out = wrapped
            .execute(&ToolCall::new("1", "message", json!({})))
            .await
            .unwrap();
        assert_eq!(out.content, "local");
    }

    #[tokio::test]
    async fn background_exec_is_rejected_without_container_round_trip() {
        let reg = registry_with(&["exec"]);
        let wrapped = wrap_for_sandbox(reg, "cid123");
        let out = wrapped
            .execute(&ToolCall::new(
                "tc1",
                "exec",
                json!({"command": "sleep 5", "background": true}),
            ))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("sandbox"));
    }

    #[tokio::test]
    async fn proxy_keeps_inner_schema() {
        let reg = registry_with(&["read"]);
        let wrapped = wrap_for_sandbox(reg, "cid123");
        let tool = wrapped.get("read").unwrap();
        assert_eq!(tool.description(), "test tool");
        assert_eq!(tool.parameters(), json!({"type": "object"}));
    }

    #[tokio::test]
    async fn child_executes_encoded_call() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "inside").unwrap();
        let call = ToolCall::new("tc1", "read", json!({"path": "f.txt"}));
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&call).unwrap());
        let registry = child_registry(dir.path().to_path_buf());
        let result = execute_encoded(&encoded, &registry).await.unwrap();
        assert_eq!(result.content, "inside");
        assert_eq!(result.tool_call_id, "tc1");
    }

    #[tokio::test]
    async fn child_registry_excludes_non_bridgeable_tools() {
        let registry = child_registry(std::path::PathBuf::from("."));
        for name in registry.names() {
            assert!(BRIDGEABLE_TOOLS.contains(&name.as_str()), "{name} leaked");
        }
        assert!(registry.get("process").is_none());
        assert!(registry.get("message").is_none());
    }

    #[tokio::test]
    async fn invalid_base64_is_an_error() {
        let registry = child_registry(std::path::PathBuf::from("."));
        assert!(execute_encoded("!!!", &registry).await.is_err());
    }
}
