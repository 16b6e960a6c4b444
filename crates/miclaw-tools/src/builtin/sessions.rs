// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use miclaw_store::SessionStore;

use crate::tool::{Tool, ToolCall, ToolResult};

/// List known sessions with their running totals.
pub struct SessionsListTool {
    pub store: Arc<SessionStore>,
}

#[async_trait]
impl Tool for SessionsListTool {
    fn name(&self) -> &str {
        "sessions_list"
    }

    fn description(&self) -> &str {
        "List conversation sessions, most recently active first."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Maximum sessions to return (default 20)" }
            },
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let limit = call.u64_arg("limit").unwrap_or(20) as usize;
        let sessions = match self.store.list_sessions(limit, 0) {
            Ok(s) => s,
            Err(e) => return Ok(ToolResult::err(&call.id, format!("store error: {e}"))),
        };
        if sessions.is_empty() {
            return Ok(ToolResult::ok(&call.id, "(no sessions)"));
        }
        let lines: Vec<String> = sessions
            .iter()
            .map(|s| {
                format!(
                    "{} — {} messages, {} prompt / {} completion tokens, ${:.4}",
                    s.id, s.message_count, s.prompt_tokens, s.completion_tokens, s.cost
                )
            })
            .collect();
        Ok(ToolResult::ok(&call.id, lines.join("\n")))
    }
}

/// Read the recent transcript of one session.
pub struct SessionsHistoryTool {
    pub store: Arc<SessionStore>,
}

#[async_trait]
impl Tool for SessionsHistoryTool {
    fn name(&self) -> &str {
        "sessions_history"
    }

    fn description(&self) -> &str {
        "Show the transcript of a session. 'limit' caps the number of \
         messages (default 20, newest kept)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string", "description": "Session to inspect" },
                "limit": { "type": "integer", "description": "Maximum messages (default 20)" }
            },
            "required": ["session_id"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(session_id) = call.str_arg("session_id") else {
            return Ok(ToolResult::err(&call.id, "missing 'session_id'"));
        };
        let limit = call.u64_arg("limit").unwrap_or(20) as usize;

        let total = match self.store.count_by_session(session_id) {
            Ok(n) => n as usize,
            Err(e) => return Ok(ToolResult::err(&call.id, format!("store error: {e}"))),
        };
        let offset = total.saturating_sub(limit);
        let messages = match self.store.list_by_session(session_id, limit, offset) {
            Ok(m) => m,
            Err(e) => return Ok(ToolResult::err(&call.id, format!("store error: {e}"))),
        };
        if messages.is_empty() {
            return Ok(ToolResult::ok(&call.id, "(no messages)"));
        }
        let lines: Vec<String> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    miclaw_provider::Role::User => "user",
                    miclaw_provider::Role::Assistant => "assistant",
                    miclaw_provider::Role::Tool => "tool",
                };
                let text = m.text();
                let text = if text.is_empty() {
                    format!("[{} part(s)]", m.parts.len())
                } else {
                    text
                };
                format!("{role}: {text}")
            })
            .collect();
        Ok(ToolResult::ok(&call.id, lines.join("\n")))
    }
}
