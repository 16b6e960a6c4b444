// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tools whose execution is confined to the sandbox container when the
/// sandbox is enabled.  The bridge substitutes each of these with a proxy.
pub const BRIDGEABLE_TOOLS: &[&str] = &["read", "write", "edit", "grep", "glob", "ls", "exec"];

/// Background process control; dropped from the toolset entirely when the
/// sandbox is active.
pub const PROCESS_TOOL: &str = "process";

/// A single tool invocation requested by the model.
///
/// Also the wire unit between the agent and the sandbox child process
/// (`--tool-call <base64(JSON)>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub parameters: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters,
        }
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    pub fn u64_arg(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(|v| v.as_u64())
    }

    pub fn bool_arg(&self, key: &str) -> Option<bool> {
        self.parameters.get(key).and_then(|v| v.as_bool())
    }
}

/// The result of executing a tool, bound to the originating call.
///
/// Tool-level failures are carried in-band (`is_error`), never as a Rust
/// error; only infrastructure failures (container vanished, broker socket
/// unreachable) surface as `Err` from [`Tool::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            tool_call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Trait every built-in tool (and the sandbox proxies) implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters(&self) -> Value;
    /// Execute the tool.  Expected failures are wrapped in
    /// [`ToolResult::err`]; `Err` is reserved for infrastructure failures.
    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_round_trips_as_json() {
        let call = ToolCall::new("tc1", "read", json!({"path": "a.txt"}));
        let text = serde_json::to_string(&call).unwrap();
        let back: ToolCall = serde_json::from_str(&text).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn tool_result_round_trips_as_json() {
        let r = ToolResult::err("tc1", "boom");
        let text = serde_json::to_string(&r).unwrap();
        let back: ToolResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, r);
        assert!(back.is_error);
    }

    #[test]
    fn arg_accessors_read_types() {
        let call = ToolCall::new("1", "t", json!({"s": "x", "n": 7, "b": true}));
        assert_eq!(call.str_arg("s"), Some("x"));
        assert_eq!(call.u64_arg("n"), Some(7));
        assert_eq!(call.bool_arg("b"), Some(true));
        assert_eq!(call.str_arg("missing"), None);
    }

    #[test]
    fn process_is_not_bridgeable() {
        assert!(!BRIDGEABLE_TOOLS.contains(&PROCESS_TOOL));
        assert!(BRIDGEABLE_TOOLS.contains(&"exec"));
        assert!(BRIDGEABLE_TOOLS.contains(&"read"));
    }
}
