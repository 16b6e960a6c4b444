// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{Tool, ToolCall, ToolResult};

const DEFAULT_LIMIT: usize = 100;
const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Regex search over workspace files.
///
/// Implemented in-process (regex + walkdir) rather than shelling out so the
/// same binary works unchanged inside the sandbox container, which has no
/// grep installed.
pub struct GrepTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns \
         path:line:text matches. 'path' scopes the search to a \
         subdirectory; 'limit' caps matches (default 100)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression to search for" },
                "path": { "type": "string", "description": "Directory or file to search (default: workspace root)" },
                "case_sensitive": { "type": "boolean", "description": "Case-sensitive search (default true)" },
                "limit": { "type": "integer", "description": "Maximum matches to return (default 100)" }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(pattern) = call.str_arg("pattern") else {
            return Ok(ToolResult::err(&call.id, "missing 'pattern'"));
        };
        let case_sensitive = call.bool_arg("case_sensitive").unwrap_or(true);
        let limit = call.u64_arg("limit").unwrap_or(DEFAULT_LIMIT as u64) as usize;
        let root = super::resolve(&self.workspace, call.str_arg("path").unwrap_or("."));

        let regex = match regex::RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::err(&call.id, format!("bad pattern: {e}"))),
        };
        debug!(pattern = %pattern, root = %root.display(), "grep tool");

        let mut matches: Vec<String> = Vec::new();
        'walk: for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_FILE_SIZE).unwrap_or(true) {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let display = entry
                .path()
                .strip_prefix(&self.workspace)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            for (idx, line) in text.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{display}:{}:{line}", idx + 1));
                    if matches.len() >= limit {
                        break 'walk;
                    }
                }
            }
        }

        if matches.is_empty() {
            Ok(ToolResult::ok(&call.id, "(no matches)"))
        } else {
            Ok(ToolResult::ok(&call.id, matches.join("\n")))
        }
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}
