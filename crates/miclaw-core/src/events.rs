// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use async_trait::async_trait;
use miclaw_provider::Message;

/// Where an input came from.  The session id encodes the concrete channel
/// identity (hook id, Signal peer, …); the source is the coarse class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Webhook,
    Signal,
    Cron,
    Cli,
}

/// The channel-adapter → agent wire: one textual input for one session.
#[derive(Debug, Clone)]
pub struct Input {
    pub session_id: String,
    pub content: String,
    pub source: Source,
    pub metadata: HashMap<String, String>,
}

impl Input {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>, source: Source) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            source,
            metadata: HashMap::new(),
        }
    }
}

/// Accepts inputs from channel adapters.  Implemented by [`crate::Agent`];
/// adapter tests substitute a recorder.
#[async_trait]
pub trait InputSink: Send + Sync {
    async fn enqueue(&self, input: Input);
}

/// The agent → subscriber wire.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub session_id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// Streaming text delta from the current assistant turn.
    Delta(String),
    /// The assistant requested tool calls (message carries the calls).
    Tool { message: Message },
    /// A completed assistant turn.
    Response { message: Message },
    /// A turn failed; the session stays usable.
    Error(String),
}

impl AgentEvent {
    pub fn delta(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind: EventKind::Delta(text.into()),
        }
    }

    pub fn response(message: Message) -> Self {
        Self {
            session_id: message.session_id.clone(),
            kind: EventKind::Response { message },
        }
    }

    pub fn tool(message: Message) -> Self {
        Self {
            session_id: message.session_id.clone(),
            kind: EventKind::Tool { message },
        }
    }

    pub fn error(session_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind: EventKind::Error(error.into()),
        }
    }
}
