// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming driver for OpenAI-compatible chat completion APIs.
//!
//! All configured backends (OpenRouter, LM Studio, Codex) speak the same
//! `/chat/completions` SSE wire format, so a single driver covers them;
//! the backend only selects defaults and auth behavior.
//!
//! SSE events can be split across TCP packets.  The stream keeps a line
//! buffer across chunks and emits events only for complete lines.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use miclaw_config::{ProviderBackend, ThinkingEffort};

use crate::{
    provider::EventStream, CompletionRequest, Message, Part, Provider, ProviderEvent, Role, Usage,
};

pub struct OpenAICompatProvider {
    backend: ProviderBackend,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    thinking_effort: ThinkingEffort,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    pub fn new(
        backend: ProviderBackend,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: u32,
        thinking_effort: ThinkingEffort,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            backend,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens,
            thinking_effort,
            client: reqwest::Client::new(),
        }
    }

    fn backend_name(&self) -> &'static str {
        match self.backend {
            ProviderBackend::Openrouter => "openrouter",
            ProviderBackend::Lmstudio => "lmstudio",
            ProviderBackend::Codex => "codex",
        }
    }
}

#[async_trait]
impl Provider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.backend_name()
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let messages = build_wire_messages(&req.system, &req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        // OpenRouter routes reasoning effort through a `reasoning` object;
        // other backends ignore the field.
        if self.backend == ProviderBackend::Openrouter {
            let effort = match self.thinking_effort {
                ThinkingEffort::Low => "low",
                ThinkingEffort::Medium => "medium",
                ThinkingEffort::High => "high",
            };
            body["reasoning"] = json!({ "effort": effort });
            body["usage"] = json!({ "include": true });
        }

        debug!(
            backend = self.backend_name(),
            model = %self.model,
            tool_count = tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.backend_name()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.backend_name());
        }

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ProviderEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── SSE parsing ──────────────────────────────────────────────────────────────

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ProviderEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse a single complete SSE `data:` line into a [`ProviderEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ProviderEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ProviderEvent::Complete {
            reason: "end_turn".into(),
        }));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v)
}

fn parse_sse_chunk(v: &Value) -> Option<anyhow::Result<ProviderEvent>> {
    // Usage-only chunk (emitted when stream_options.include_usage = true).
    // OpenRouter additionally reports the request cost in usage.cost.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Some(Ok(ProviderEvent::Usage(Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            cost: usage["cost"].as_f64().unwrap_or(0.0),
        })));
    }

    let choice = &v["choices"][0];
    let delta = &choice["delta"];

    if let Some(tool_calls) = delta.get("tool_calls") {
        if let Some(tc) = tool_calls.get(0) {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            let id = tc["id"].as_str().unwrap_or("").to_string();
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let args = tc["function"]["arguments"]
                .as_str()
                .unwrap_or("")
                .to_string();
            return Some(Ok(ProviderEvent::ToolCall {
                index,
                id,
                name,
                arguments: args,
            }));
        }
    }

    // Reasoning delta — two common field names:
    //   `reasoning_content` (llama.cpp, DeepSeek), `reasoning` (OpenRouter).
    let reasoning = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
        return Some(Ok(ProviderEvent::ReasoningDelta(text.to_string())));
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            return Some(Ok(ProviderEvent::ContentDelta(text.to_string())));
        }
    }

    // finish_reason arrives on the final content chunk; the [DONE] sentinel
    // that follows emits Complete, so a non-"stop" reason is only surfaced
    // when it signals truncation.
    if choice["finish_reason"].as_str() == Some("length") {
        return Some(Ok(ProviderEvent::Complete {
            reason: "max_tokens".into(),
        }));
    }

    None
}

// ─── Wire message building ────────────────────────────────────────────────────

/// Convert the system prompt and transcript into the OpenAI wire-format
/// message array.
///
/// **Parallel tool call coalescing**: the wire format requires all tool
/// calls of one assistant turn inside a single assistant message as a
/// `tool_calls` array; miclaw stores them as ordered parts of one assistant
/// message, so each assistant message maps to at most one wire message.
/// Reasoning parts are private to the transcript and are never sent back.
pub(crate) fn build_wire_messages(system: &str, messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len() + 1);
    if !system.is_empty() {
        wire.push(json!({ "role": "system", "content": system }));
    }

    for m in messages {
        match m.role {
            Role::User => {
                wire.push(json!({ "role": "user", "content": m.text() }));
            }
            Role::Assistant => {
                let text = m.text();
                let tool_calls: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ToolCall {
                            id,
                            name,
                            parameters,
                        } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": parameters.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant", "content": text });
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls);
                }
                wire.push(msg);
            }
            Role::Tool => {
                for p in &m.parts {
                    if let Part::ToolResult {
                        tool_call_id,
                        content,
                        ..
                    } = p
                    {
                        wire.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": content,
                        }));
                    }
                }
            }
        }
    }
    wire
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
