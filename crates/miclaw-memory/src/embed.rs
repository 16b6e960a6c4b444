// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

/// Something that can turn a batch of texts into embedding vectors.
///
/// The indexer depends on this trait so sync tests can count requests
/// without a network.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Client for a remote OpenAI-compatible `POST /embeddings` endpoint.
pub struct EmbedClient {
    url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl EmbedClient {
    /// `base_url` may be the API base or the full `/embeddings` endpoint.
    pub fn new(base_url: &str, model: impl Into<String>, api_key: Option<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        let url = if base.ends_with("/embeddings") {
            base.to_string()
        } else {
            format!("{base}/embeddings")
        };
        Self {
            url,
            model: model.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for EmbedClient {
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = texts.len(), "requesting embeddings");
        let body = json!({ "model": self.model, "input": texts });
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("embeddings request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("embeddings error {status}: {text}");
        }
        let v: Value = resp.json().await.context("embeddings response body")?;
        parse_embeddings_response(&v, texts.len())
    }
}

/// Pull the vectors out of an embeddings response body.
///
/// Expects `{"data": [{"embedding": [f32, ...]}, ...]}` with exactly
/// `expected` items, in request order.
fn parse_embeddings_response(v: &Value, expected: usize) -> anyhow::Result<Vec<Vec<f32>>> {
    let data = v["data"]
        .as_array()
        .context("embeddings response missing data array")?;
    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let emb = item["embedding"]
            .as_array()
            .context("embedding item missing vector")?;
        vectors.push(
            emb.iter()
                .map(|x| x.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    if vectors.len() != expected {
        bail!(
            "embeddings count mismatch: sent {expected}, got {}",
            vectors.len()
        );
    }
    Ok(vectors)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
