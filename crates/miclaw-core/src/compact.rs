// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic transcript repair for compaction.
//!
//! Before a transcript can be summarized it must be structurally valid for
//! the provider: every tool call paired with a result, and the history
//! ending on an assistant message.  Both repairs are pure so they can be
//! tested without a model.

use miclaw_provider::{Message, Part, Role};

/// Prompt for the single summarization call.
pub const SUMMARIZE_PROMPT: &str =
    "Summarize the conversation so far in a concise, information-dense way. \
     Preserve decisions, file names, tool outcomes, and any constraints the \
     user stated. The summary will replace the full history.";

/// Insert a synthetic empty tool result for every tool call that has none.
///
/// Each synthetic result message is placed directly after the assistant
/// message that carried the dangling call, keeping the call/result pairing
/// adjacent the way a normal turn would.
pub fn repair_dangling_tool_calls(messages: &mut Vec<Message>) {
    let answered: std::collections::HashSet<String> = messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            Part::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();

    let mut repaired: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages.drain(..) {
        let dangling: Vec<String> = message
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall { id, .. } if !answered.contains(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        let session_id = message.session_id.clone();
        repaired.push(message);
        for id in dangling {
            repaired.push(Message::tool_result(&session_id, id, "", false));
        }
    }
    *messages = repaired;
}

/// Drop trailing non-assistant messages so the history ends on an
/// assistant turn.  Tool results belonging to the final assistant message
/// survive because pairing repair runs first and the trim only strips a
/// trailing run of user messages.
pub fn trim_to_assistant_tail(messages: &mut Vec<Message>) {
    while let Some(last) = messages.last() {
        match last.role {
            Role::Assistant | Role::Tool => break,
            Role::User => {
                messages.pop();
            }
        }
    }
}

/// Text of the most recent user message, if any.
pub fn last_user_text(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.text())
}

/// The replacement transcript after a summary was produced.  The system
/// prompt is rebuilt per turn, so the stored history is just the synthetic
/// user message.
pub fn build_compacted_history(
    session_id: &str,
    summary: &str,
    last_user: Option<&str>,
) -> Vec<Message> {
    let text = match last_user {
        Some(last) if !last.is_empty() => {
            format!("{summary} Last request from user was: {last}")
        }
        _ => summary.to_string(),
    };
    vec![Message::user(session_id, text)]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
