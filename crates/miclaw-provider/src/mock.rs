// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::EventStream, CompletionRequest, Provider, ProviderEvent, Usage};

/// A pre-scripted mock provider.  Each call to `stream` pops the next
/// response script from the front of the queue.  This lets tests specify
/// exact event sequences — including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<ProviderEvent>>>>,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `stream()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Total number of `stream()` calls made against this provider.
    pub call_count: Arc<Mutex<usize>>,
}

impl ScriptedProvider {
    /// Build a provider from an ordered list of call scripts.  When the
    /// scripts run out, further calls repeat the last script.
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ProviderEvent::ContentDelta(r),
            ProviderEvent::Usage(Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
                cost: 0.0,
            }),
            ProviderEvent::Complete {
                reason: "end_turn".into(),
            },
        ]])
    }

    /// Convenience: provider that returns a tool call first, then a text
    /// reply on the follow-up call.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ProviderEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ProviderEvent::Complete {
                    reason: "tool_calls".into(),
                },
            ],
            vec![
                ProviderEvent::ContentDelta(final_text.into()),
                ProviderEvent::Usage(Usage {
                    prompt_tokens: 5,
                    completion_tokens: 5,
                    cost: 0.0,
                }),
                ProviderEvent::Complete {
                    reason: "end_turn".into(),
                },
            ],
        ])
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.call_count.lock().unwrap() += 1;
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.len() > 1 {
                scripts.remove(0)
            } else {
                scripts.first().cloned().unwrap_or_else(|| {
                    vec![ProviderEvent::Complete {
                        reason: "end_turn".into(),
                    }]
                })
            }
        };
        let events: Vec<anyhow::Result<ProviderEvent>> = script.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
