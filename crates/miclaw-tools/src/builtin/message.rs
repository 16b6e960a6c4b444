// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolResult};

/// Outbound delivery seam for the `message` tool.  The runtime wires this to
/// the channel adapters; tests substitute a recorder.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, session_id: &str, text: &str) -> anyhow::Result<()>;
}

/// Send a message to a session's channel outside the normal turn reply,
/// e.g. a progress note during a long tool sequence.
pub struct MessageTool {
    pub sink: Arc<dyn MessageSink>,
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a text message to a session's channel immediately, without \
         waiting for the turn to finish."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string", "description": "Target session id" },
                "text": { "type": "string", "description": "Message text" }
            },
            "required": ["session_id", "text"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(session_id) = call.str_arg("session_id") else {
            return Ok(ToolResult::err(&call.id, "missing 'session_id'"));
        };
        let Some(text) = call.str_arg("text") else {
            return Ok(ToolResult::err(&call.id, "missing 'text'"));
        };
        match self.sink.send(session_id, text).await {
            Ok(()) => Ok(ToolResult::ok(&call.id, "sent")),
            Err(e) => Ok(ToolResult::err(&call.id, format!("send failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageSink for Recorder {
        async fn send(&self, session_id: &str, text: &str) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((session_id.into(), text.into()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_to_sink() {
        let recorder = Arc::new(Recorder {
            sent: Mutex::new(vec![]),
        });
        let tool = MessageTool {
            sink: recorder.clone(),
        };
        let out = tool
            .run(&ToolCall::new(
                "1",
                "message",
                json!({"session_id": "signal:dm:x", "text": "hi"}),
            ))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(
            recorder.sent.lock().unwrap()[0],
            ("signal:dm:x".to_string(), "hi".to_string())
        );
    }

    #[tokio::test]
    async fn missing_args_are_error_results() {
        let recorder = Arc::new(Recorder {
            sent: Mutex::new(vec![]),
        });
        let tool = MessageTool { sink: recorder };
        let out = tool
            .run(&ToolCall::new("1", "message", json!({"text": "hi"})))
            .await
            .unwrap();
        assert!(out.is_error);
    }
}
