// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolResult};

/// Exact-string replacement edit.  `old` must appear exactly once unless
/// `replace_all` is set; ambiguity is reported back instead of guessing.
pub struct EditFileTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact text snippet in a file. 'old' must match exactly \
         one location (including whitespace); set 'replace_all' to change \
         every occurrence."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path (workspace-relative or absolute)" },
                "old": { "type": "string", "description": "Exact text to replace" },
                "new": { "type": "string", "description": "Replacement text" },
                "replace_all": { "type": "boolean", "description": "Replace every occurrence (default false)" }
            },
            "required": ["path", "old", "new"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(path) = call.str_arg("path") else {
            return Ok(ToolResult::err(&call.id, "missing 'path'"));
        };
        let Some(old) = call.str_arg("old") else {
            return Ok(ToolResult::err(&call.id, "missing 'old'"));
        };
        let Some(new) = call.str_arg("new") else {
            return Ok(ToolResult::err(&call.id, "missing 'new'"));
        };
        if old.is_empty() {
            return Ok(ToolResult::err(&call.id, "'old' must not be empty"));
        }
        let replace_all = call.bool_arg("replace_all").unwrap_or(false);
        let full = super::resolve(&self.workspace, path);
        debug!(path = %full.display(), "edit tool");

        let text = match tokio::fs::read_to_string(&full).await {
            Ok(t) => t,
            Err(e) => return Ok(ToolResult::err(&call.id, format!("read error: {e}"))),
        };

        let count = text.matches(old).count();
        if count == 0 {
            return Ok(ToolResult::err(
                &call.id,
                "'old' text not found in file; re-read the file and retry with the exact snippet",
            ));
        }
        if count > 1 && !replace_all {
            return Ok(ToolResult::err(
                &call.id,
                format!("'old' text matches {count} locations; provide more context or set replace_all"),
            ));
        }

        let updated = if replace_all {
            text.replace(old, new)
        } else {
            text.replacen(old, new, 1)
        };
        match tokio::fs::write(&full, &updated).await {
            Ok(()) => Ok(ToolResult::ok(
                &call.id,
                format!("replaced {} occurrence(s) in {path}", if replace_all { count } else { 1 }),
            )),
            Err(e) => Ok(ToolResult::err(&call.id, format!("write error: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(dir: &tempfile::TempDir) -> EditFileTool {
        EditFileTool {
            workspace: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn replaces_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha beta gamma").unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new(
                "1",
                "edit",
                json!({"path": "a.txt", "old": "beta", "new": "BETA"}),
            ))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "alpha BETA gamma"
        );
    }

    #[tokio::test]
    async fn ambiguous_match_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x x").unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new(
                "1",
                "edit",
                json!({"path": "a.txt", "old": "x", "new": "y"}),
            ))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("2 locations"));
    }

    #[tokio::test]
    async fn replace_all_changes_every_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x x x").unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new(
                "1",
                "edit",
                json!({"path": "a.txt", "old": "x", "new": "y", "replace_all": true}),
            ))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "y y y"
        );
    }

    #[tokio::test]
    async fn missing_old_text_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "content").unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new(
                "1",
                "edit",
                json!({"path": "a.txt", "old": "absent", "new": "y"}),
            ))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("not found"));
    }
}
