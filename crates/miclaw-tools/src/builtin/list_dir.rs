// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolResult};

/// List a directory, one entry per line, directories suffixed with `/`.
pub struct ListDirTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List a directory. Entries are sorted; directories end with '/'."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: workspace root)" }
            },
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let path = call.str_arg("path").unwrap_or(".");
        let full = super::resolve(&self.workspace, path);

        let mut dir = match tokio::fs::read_dir(&full).await {
            Ok(d) => d,
            Err(e) => return Ok(ToolResult::err(&call.id, format!("ls error: {e}"))),
        };
        let mut entries: Vec<String> = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();

        if entries.is_empty() {
            Ok(ToolResult::ok(&call.id, "(empty)"))
        } else {
            Ok(ToolResult::ok(&call.id, entries.join("\n")))
        }
    }
}
