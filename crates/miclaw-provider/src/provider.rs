// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use miclaw_config::{ProviderBackend, ProviderConfig};

use crate::{CompletionRequest, ProviderEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<ProviderEvent>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend identifier for status display and logs.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream>;

    /// Probe the provider for an accurate prompt token count by issuing a
    /// minimal completion (max output 16) and reading the usage event.
    ///
    /// The default drives the regular streaming path; providers with a
    /// dedicated counting endpoint can override.
    async fn count_tokens(&self, req: CompletionRequest) -> anyhow::Result<u32> {
        use futures::StreamExt;
        let mut req = req;
        req.max_tokens = Some(16);
        let mut stream = self.stream(req).await?;
        let mut prompt_tokens = 0;
        while let Some(event) = stream.next().await {
            if let ProviderEvent::Usage(u) = event? {
                prompt_tokens = u.prompt_tokens;
            }
        }
        Ok(prompt_tokens)
    }
}

/// Construct the provider selected by the config.
///
/// All three backends speak the OpenAI-compatible `/chat/completions` SSE
/// wire format; they differ only in default base URL and whether an API key
/// is required.
pub fn from_config(config: &ProviderConfig) -> anyhow::Result<Arc<dyn Provider>> {
    let (default_base, needs_key) = match config.backend {
        ProviderBackend::Openrouter => ("https://openrouter.ai/api/v1", true),
        ProviderBackend::Lmstudio => ("http://127.0.0.1:1234/v1", false),
        ProviderBackend::Codex => ("https://chatgpt.com/backend-api/codex", true),
    };
    let base_url = config
        .base_url
        .clone()
        .unwrap_or_else(|| default_base.to_string());
    if needs_key && config.api_key.as_deref().unwrap_or("").is_empty() {
        anyhow::bail!(
            "provider.api_key is required for the {:?} backend",
            config.backend
        );
    }
    Ok(Arc::new(crate::OpenAICompatProvider::new(
        config.backend,
        config.model.clone(),
        config.api_key.clone(),
        &base_url,
        config.max_tokens,
        config.thinking_effort,
    )))
}
