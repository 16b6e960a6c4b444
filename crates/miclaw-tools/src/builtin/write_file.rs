// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolResult};

/// Write (or overwrite) a file, creating parent directories as needed.
pub struct WriteFileTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write text content to a file, replacing what was there. Parent \
         directories are created automatically."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path (workspace-relative or absolute)" },
                "content": { "type": "string", "description": "Full file content to write" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(path) = call.str_arg("path") else {
            return Ok(ToolResult::err(&call.id, "missing 'path'"));
        };
        let Some(content) = call.str_arg("content") else {
            return Ok(ToolResult::err(&call.id, "missing 'content'"));
        };
        let full = super::resolve(&self.workspace, path);
        debug!(path = %full.display(), bytes = content.len(), "write tool");

        if let Some(parent) = full.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return Ok(ToolResult::err(&call.id, format!("mkdir error: {e}")));
                }
            }
        }
        match tokio::fs::write(&full, content).await {
            Ok(()) => Ok(ToolResult::ok(
                &call.id,
                format!("wrote {} bytes to {path}", content.len()),
            )),
            Err(e) => Ok(ToolResult::err(&call.id, format!("write error: {e}"))),
        }
    }
}
