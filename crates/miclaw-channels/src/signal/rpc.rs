// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-RPC + SSE client for the signal-cli HTTP bridge.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use super::markdown::StyleSpan;

/// One inbound unit from the bridge: sender identity plus a data message.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Envelope {
    #[serde(default, rename = "sourceNumber")]
    pub source_number: Option<String>,
    #[serde(default, rename = "sourceUuid")]
    pub source_uuid: Option<String>,
    #[serde(default, rename = "dataMessage")]
    pub data_message: Option<DataMessage>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DataMessage {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "groupInfo")]
    pub group_info: Option<GroupInfo>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GroupInfo {
    #[serde(rename = "groupId")]
    pub group_id: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Mention {
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
}

/// Where an outbound send is addressed.
#[derive(Debug, Clone)]
pub enum SendTarget {
    Dm(String),
    Group(String),
}

pub struct SignalClient {
    base_url: String,
    account: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl SignalClient {
    pub fn new(base_url: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account: account.into(),
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open the SSE event stream and yield parsed envelopes.
    ///
    /// SSE events can split across TCP chunks; complete `data:` lines are
    /// drained from a carry-over buffer like the provider stream does.
    pub async fn envelopes(
        &self,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<Envelope>> + Send>>> {
        let url = format!("{}/api/v1/events", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .context("signal event stream request failed")?;
        if !resp.status().is_success() {
            bail!("signal event stream error {}", resp.status());
        }
        let stream = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let envelopes: Vec<anyhow::Result<Envelope>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_envelope_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(envelopes))
            })
            .flat_map(futures::stream::iter);
        Ok(Box::pin(stream))
    }

    /// JSON-RPC `send` with optional text styles.
    pub async fn send(
        &self,
        target: &SendTarget,
        text: &str,
        styles: &[StyleSpan],
    ) -> anyhow::Result<()> {
        let mut params = json!({
            "account": self.account,
            "message": text,
        });
        match target {
            SendTarget::Dm(peer) => params["recipient"] = json!([peer]),
            SendTarget::Group(group_id) => params["groupId"] = json!(group_id),
        }
        if !styles.is_empty() {
            let rendered: Vec<String> = styles
                .iter()
                .map(|s| format!("{}:{}:{}", s.start, s.length, s.style.as_str()))
                .collect();
            params["textStyle"] = json!(rendered);
        }
        self.rpc("send", params).await.map(|_| ())
    }

    /// Start or stop the typing indicator towards a peer or group.
    pub async fn typing(&self, target: &SendTarget, stop: bool) -> anyhow::Result<()> {
        let mut params = json!({
            "account": self.account,
            "stop": stop,
        });
        match target {
            SendTarget::Dm(peer) => params["recipient"] = json!([peer]),
            SendTarget::Group(group_id) => params["groupId"] = json!(group_id),
        }
        self.rpc("sendTyping", params).await.map(|_| ())
    }

    async fn rpc(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        debug!(method, id, "signal rpc");
        let resp = self
            .client
            .post(format!("{}/api/v1/rpc", self.base_url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("signal rpc {method} failed"))?;
        if !resp.status().is_success() {
            bail!("signal rpc {method} error {}", resp.status());
        }
        let value: Value = resp.json().await.context("signal rpc response body")?;
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            bail!("signal rpc {method} returned error: {error}");
        }
        Ok(value)
    }
}

/// Drain complete SSE `data:` lines from `buf` and parse each as an
/// envelope wrapper.  Non-envelope events are skipped.
pub(crate) fn drain_envelope_lines(buf: &mut String) -> Vec<anyhow::Result<Envelope>> {
    let mut out = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim_end_matches('\r').to_string();
        *buf = buf[pos + 1..].to_string();
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if let Some(envelope) = parse_envelope_json(data) {
            out.push(Ok(envelope));
        }
    }
    out
}

/// The bridge wraps envelopes as `{"envelope": {...}, "account": "..."}`;
/// some builds deliver the envelope bare.  Accept both.
fn parse_envelope_json(data: &str) -> Option<Envelope> {
    let value: Value = serde_json::from_str(data).ok()?;
    let inner = value.get("envelope").cloned().unwrap_or(value);
    serde_json::from_value(inner).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_envelope_parses() {
        let mut buf = String::from(
            "data: {\"envelope\":{\"sourceNumber\":\"+123\",\"sourceUuid\":\"u1\",\
             \"dataMessage\":{\"message\":\"hi\"}}}\n",
        );
        let envelopes = drain_envelope_lines(&mut buf);
        assert_eq!(envelopes.len(), 1);
        let env = envelopes[0].as_ref().unwrap();
        assert_eq!(env.source_number.as_deref(), Some("+123"));
        assert_eq!(
            env.data_message.as_ref().unwrap().message.as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn bare_envelope_parses() {
        let mut buf =
            String::from("data: {\"sourceUuid\":\"u2\",\"dataMessage\":{\"message\":\"x\"}}\n");
        let envelopes = drain_envelope_lines(&mut buf);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].as_ref().unwrap().source_uuid.as_deref(), Some("u2"));
    }

    #[test]
    fn partial_line_waits_for_more_bytes() {
        let mut buf = String::from("data: {\"sourceUuid\":\"u");
        assert!(drain_envelope_lines(&mut buf).is_empty());
        buf.push_str("3\",\"dataMessage\":{\"message\":\"y\"}}\n");
        assert_eq!(drain_envelope_lines(&mut buf).len(), 1);
    }

    #[test]
    fn group_info_and_mentions_parse() {
        let json = r#"{"sourceUuid":"u","dataMessage":{"message":"@x hello",
            "groupInfo":{"groupId":"g1"},
            "mentions":[{"start":0,"length":2,"uuid":"mention-uuid"}]}}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        let dm = env.data_message.unwrap();
        assert_eq!(dm.group_info.unwrap().group_id, "g1");
        assert_eq!(dm.mentions[0].uuid.as_deref(), Some("mention-uuid"));
    }

    #[test]
    fn keepalive_and_event_lines_are_skipped() {
        let mut buf = String::from(": ping\nevent: receive\ndata: \n");
        assert!(drain_envelope_lines(&mut buf).is_empty());
    }
}
