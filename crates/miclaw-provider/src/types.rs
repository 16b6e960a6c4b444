// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Message parts ────────────────────────────────────────────────────────────

/// One element of a message's ordered content.
///
/// The set of variants is closed: the `"type"` discriminator is a whitelist
/// and unknown tags fail deserialization loudly, so stale rows written by a
/// newer build are rejected rather than silently mangled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    /// Model's private reasoning trace; never echoed back to channels.
    Reasoning {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        parameters: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    /// Terminal marker of an assistant turn.
    Finish {
        reason: String,
    },
    Binary {
        mime_type: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
}

/// Base64 transport encoding for `Part::Binary` payloads.  A raw byte array
/// would serialize as a JSON number list, bloating rows ~4x.
mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One element of a session's transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            Role::User,
            vec![Part::Text { text: text.into() }],
        )
    }

    pub fn assistant(session_id: impl Into<String>, parts: Vec<Part>) -> Self {
        Self::new(session_id, Role::Assistant, parts)
    }

    pub fn tool_result(
        session_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::new(
            session_id,
            Role::Tool,
            vec![Part::ToolResult {
                tool_call_id: tool_call_id.into(),
                content: content.into(),
                is_error,
            }],
        )
    }

    /// Concatenated text of all Text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All tool calls carried by this message, in declared order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall {
                    id,
                    name,
                    parameters,
                } => Some((id.as_str(), name.as_str(), parameters)),
                _ => None,
            })
            .collect()
    }

    /// Approximate token count using the 4-chars-per-token heuristic.
    /// Binary parts count a flat overhead since they are not sent as text.
    pub fn approx_tokens(&self) -> usize {
        let chars: usize = self
            .parts
            .iter()
            .map(|p| match p {
                Part::Text { text } | Part::Reasoning { text } => text.len(),
                Part::ToolCall {
                    name, parameters, ..
                } => name.len() + parameters.to_string().len(),
                Part::ToolResult { content, .. } => content.len(),
                Part::Finish { reason } => reason.len(),
                Part::Binary { .. } => 1024,
            })
            .sum();
        (chars / 4).max(1)
    }
}

// ─── Provider wire types ──────────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// System prompt; assembled per turn and never stored in the transcript.
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Output token cap for this call; `None` uses the configured default.
    pub max_tokens: Option<u32>,
}

/// Token usage reported at the end of a provider stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: f64,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A text delta streamed from the model
    ContentDelta(String),
    /// A reasoning/thinking delta
    ReasoningDelta(String),
    /// Partial tool call; chunks for parallel calls are interleaved by index
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    Usage(Usage),
    /// The stream finished normally
    Complete { reason: String },
    /// A recoverable stream error (non-fatal warning)
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
