// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolResult};

const READ_LIMIT: usize = 200_000;

/// Read a file from the workspace, optionally a line range.
pub struct ReadFileTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a text file. Returns the whole file, or a window when 'offset' \
         (1-based line) and 'limit' (line count) are given. Output is capped \
         at 200 KB."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path (workspace-relative or absolute)" },
                "offset": { "type": "integer", "description": "1-based first line to read (optional)" },
                "limit": { "type": "integer", "description": "Number of lines to read (optional)" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(path) = call.str_arg("path") else {
            return Ok(ToolResult::err(&call.id, "missing 'path'"));
        };
        let full = super::resolve(&self.workspace, path);
        debug!(path = %full.display(), "read tool");

        let text = match tokio::fs::read_to_string(&full).await {
            Ok(t) => t,
            Err(e) => return Ok(ToolResult::err(&call.id, format!("read error: {e}"))),
        };

        let offset = call.u64_arg("offset").unwrap_or(1).max(1) as usize;
        let limit = call.u64_arg("limit").map(|l| l as usize);

        let content = match limit {
            None if offset == 1 => text,
            _ => {
                let lines: Vec<&str> = text.lines().collect();
                let start = (offset - 1).min(lines.len());
                let end = match limit {
                    Some(l) => (start + l).min(lines.len()),
                    None => lines.len(),
                };
                lines[start..end].join("\n")
            }
        };

        let content = if content.len() > READ_LIMIT {
            format!("{}...[truncated]", &content[..READ_LIMIT])
        } else {
            content
        };
        Ok(ToolResult::ok(&call.id, content))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
