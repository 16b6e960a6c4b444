// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::{Tool, ToolCall, ToolResult};

const DEFAULT_LIMIT: usize = 500;

/// Find files by glob pattern (`*`, `**`, `?` supported).
pub struct GlobTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern like 'src/**/*.rs' or '*.md'. \
         Matching is against workspace-relative paths."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Glob pattern (*, **, ? supported)" },
                "limit": { "type": "integer", "description": "Maximum paths to return (default 500)" }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(pattern) = call.str_arg("pattern") else {
            return Ok(ToolResult::err(&call.id, "missing 'pattern'"));
        };
        let limit = call.u64_arg("limit").unwrap_or(DEFAULT_LIMIT as u64) as usize;

        let regex = match glob_to_regex(pattern) {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::err(&call.id, format!("bad pattern: {e}"))),
        };

        let mut paths: Vec<String> = Vec::new();
        for entry in WalkDir::new(&self.workspace)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.workspace)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if regex.is_match(&rel) {
                paths.push(rel);
                if paths.len() >= limit {
                    break;
                }
            }
        }
        paths.sort();

        if paths.is_empty() {
            Ok(ToolResult::ok(&call.id, "(no matches)"))
        } else {
            Ok(ToolResult::ok(&call.id, paths.join("\n")))
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

/// Translate a glob into an anchored regex.  `**/` also matches zero
/// directories so `**/*.rs` finds files at the root.
fn glob_to_regex(glob: &str) -> anyhow::Result<regex::Regex> {
    let mut re = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:[^/]+/)*");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '[' | ']' | '\\' => {
                re.push('\\');
                re.push(c);
            }
            other => re.push(other),
        }
    }
    re.push('$');
    Ok(regex::Regex::new(&re)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(dir: &tempfile::TempDir) -> GlobTool {
        GlobTool {
            workspace: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn matches_extension_at_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "").unwrap();
        std::fs::write(dir.path().join("b.md"), "").unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new("1", "glob", json!({"pattern": "*.rs"})))
            .await
            .unwrap();
        assert_eq!(out.content, "a.rs");
    }

    #[tokio::test]
    async fn double_star_spans_directories_including_zero() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/deep")).unwrap();
        std::fs::write(dir.path().join("root.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/deep/x.rs"), "").unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new("1", "glob", json!({"pattern": "**/*.rs"})))
            .await
            .unwrap();
        let lines: Vec<&str> = out.content.lines().collect();
        assert_eq!(lines, vec!["root.rs", "src/deep/x.rs"]);
    }

    #[tokio::test]
    async fn question_mark_matches_single_char() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a1.txt"), "").unwrap();
        std::fs::write(dir.path().join("a22.txt"), "").unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new("1", "glob", json!({"pattern": "a?.txt"})))
            .await
            .unwrap();
        assert_eq!(out.content, "a1.txt");
    }

    #[tokio::test]
    async fn no_match_reports_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(&dir)
            .run(&ToolCall::new("1", "glob", json!({"pattern": "*.zig"})))
            .await
            .unwrap();
        assert_eq!(out.content, "(no matches)");
    }
}
