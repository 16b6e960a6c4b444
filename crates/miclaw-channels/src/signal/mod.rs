// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Signal channel pipeline.
//!
//! Inbound: consume envelopes from the signal-cli SSE bridge, drop
//! self-messages and empty envelopes, apply DM/group access policies,
//! re-render inline mentions, and enqueue under `signal:dm:<uuid>` /
//! `signal:group:<gid>` session ids.  Outbound: watch the agent event bus
//! for those sessions, convert markdown to Signal text styles, chunk, and
//! send via JSON-RPC.  A typing indicator runs while a turn is pending.

pub mod markdown;
pub mod rpc;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use miclaw_config::{AccessPolicy, SignalConfig};
use miclaw_core::{EventBus, EventKind, Input, InputSink, Source};

use rpc::{Envelope, Mention, SendTarget, SignalClient};

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

pub struct SignalPipeline {
    config: SignalConfig,
    client: Arc<SignalClient>,
    sink: Arc<dyn InputSink>,
}

/// A classified inbound message ready for the agent.
#[derive(Debug, Clone, PartialEq)]
struct Inbound {
    session_id: String,
    content: String,
    sender_number: Option<String>,
    sender_uuid: Option<String>,
    group_id: Option<String>,
}

impl SignalPipeline {
    pub fn new(config: SignalConfig, sink: Arc<dyn InputSink>) -> Self {
        let client = Arc::new(SignalClient::new(config.base_url(), config.account.clone()));
        Self {
            config,
            client,
            sink,
        }
    }

    /// Run inbound and outbound halves until `shutdown` flips.
    pub async fn run(self: Arc<Self>, bus: EventBus, shutdown: watch::Receiver<bool>) {
        let outbound = tokio::spawn(
            self.clone()
                .outbound_loop(bus.subscribe(), shutdown.clone()),
        );
        self.inbound_loop(shutdown).await;
        let _ = outbound.await;
        info!("signal pipeline stopped");
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    async fn inbound_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = RECONNECT_MIN;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let stream = tokio::select! {
                _ = shutdown.changed() => return,
                connected = self.client.envelopes() => connected,
            };
            match stream {
                Ok(mut envelopes) => {
                    info!("signal event stream connected");
                    loop {
                        let envelope = tokio::select! {
                            _ = shutdown.changed() => return,
                            envelope = envelopes.next() => envelope,
                        };
                        match envelope {
                            Some(Ok(envelope)) => {
                                backoff = RECONNECT_MIN;
                                self.handle_envelope(envelope).await;
                            }
                            Some(Err(e)) => {
                                warn!("signal stream error: {e:#}");
                                break;
                            }
                            None => {
                                warn!("signal stream closed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("signal connect failed: {e:#}"),
            }
            debug!(delay = ?backoff, "signal reconnecting");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let Some(inbound) = classify(&self.config, &envelope) else {
            return;
        };
        debug!(session_id = %inbound.session_id, "signal message accepted");

        // Typing indicator while the agent works on the reply.
        if let Some(target) = parse_session_target(&inbound.session_id) {
            let _ = self.client.typing(&target, false).await;
        }

        let mut input = Input::new(&inbound.session_id, &inbound.content, Source::Signal);
        if let Some(number) = &inbound.sender_number {
            input.metadata.insert("sender_number".into(), number.clone());
        }
        if let Some(uuid) = &inbound.sender_uuid {
            input.metadata.insert("sender_uuid".into(), uuid.clone());
        }
        if let Some(group) = &inbound.group_id {
            input.metadata.insert("group_id".into(), group.clone());
        }
        self.sink.enqueue(input).await;
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    async fn outbound_loop(
        self: Arc<Self>,
        mut sub: miclaw_core::Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return,
                event = sub.recv() => event,
            };
            let Some(event) = event else { return };
            if !event.session_id.starts_with("signal:") {
                continue;
            }
            let Some(target) = parse_session_target(&event.session_id) else {
                continue;
            };
            match event.kind {
                EventKind::Response { message } => {
                    let text = message.text();
                    if text.is_empty() {
                        continue;
                    }
                    self.deliver(&target, &text).await;
                    let _ = self.client.typing(&target, true).await;
                }
                EventKind::Error(error) => {
                    self.deliver(&target, &format!("Error: {error}")).await;
                    let _ = self.client.typing(&target, true).await;
                }
                EventKind::Delta(_) | EventKind::Tool { .. } => {}
            }
        }
    }

    async fn deliver(&self, target: &SendTarget, markdown_text: &str) {
        let (plain, styles) = markdown::render(markdown_text);
        let chunks = chunk_text(&plain, self.config.text_chunk_limit);
        let single = chunks.len() == 1;
        for chunk in chunks {
            // Style offsets only survive when the text was not split.
            let styles = if single { styles.as_slice() } else { &[] };
            if let Err(e) = self.client.send(target, &chunk, styles).await {
                warn!("signal send failed: {e:#}");
                return;
            }
        }
    }
}

// ─── Classification ───────────────────────────────────────────────────────────

/// Apply drop rules and access policies; produce the session id and the
/// mention-rendered text.
fn classify(config: &SignalConfig, envelope: &Envelope) -> Option<Inbound> {
    // Self-messages (sync copies of our own sends) are dropped.
    if envelope.source_number.as_deref() == Some(config.account.as_str()) {
        return None;
    }
    let data = envelope.data_message.as_ref()?;
    let text = data.message.as_deref().filter(|m| !m.trim().is_empty())?;

    let (session_id, allowed) = match &data.group_info {
        Some(group) => {
            let allowed = match config.group_policy {
                AccessPolicy::Open => true,
                AccessPolicy::Disabled => false,
                AccessPolicy::Allowlist => config.allowlist.iter().any(|a| a == &group.group_id),
            };
            (format!("signal:group:{}", group.group_id), allowed)
        }
        None => {
            let peer = envelope
                .source_uuid
                .clone()
                .or_else(|| envelope.source_number.clone())?;
            let allowed = match config.dm_policy {
                AccessPolicy::Open => true,
                AccessPolicy::Disabled => false,
                AccessPolicy::Allowlist => config.allowlist.iter().any(|a| {
                    Some(a.as_str()) == envelope.source_number.as_deref()
                        || Some(a.as_str()) == envelope.source_uuid.as_deref()
                }),
            };
            (format!("signal:dm:{peer}"), allowed)
        }
    };
    if !allowed {
        debug!(session_id = %session_id, "signal message rejected by policy");
        return None;
    }

    Some(Inbound {
        session_id,
        content: render_mentions(text, &data.mentions),
        sender_number: envelope.source_number.clone(),
        sender_uuid: envelope.source_uuid.clone(),
        group_id: data.group_info.as_ref().map(|g| g.group_id.clone()),
    })
}

/// Replace mention placeholder spans with `@<number-or-uuid>`.
/// Spans are applied back-to-front so earlier offsets stay valid.
fn render_mentions(text: &str, mentions: &[Mention]) -> String {
    if mentions.is_empty() {
        return text.to_string();
    }
    let mut chars: Vec<char> = text.chars().collect();
    let mut sorted: Vec<&Mention> = mentions.iter().collect();
    sorted.sort_by_key(|m| std::cmp::Reverse(m.start));
    for mention in sorted {
        let end = (mention.start + mention.length).min(chars.len());
        if mention.start >= chars.len() {
            continue;
        }
        let label = mention
            .number
            .as_deref()
            .or(mention.uuid.as_deref())
            .unwrap_or("unknown");
        let replacement: Vec<char> = format!("@{label}").chars().collect();
        chars.splice(mention.start..end, replacement);
    }
    chars.into_iter().collect()
}

/// Recover the JSON-RPC target from a `signal:` session id.
fn parse_session_target(session_id: &str) -> Option<SendTarget> {
    if let Some(peer) = session_id.strip_prefix("signal:dm:") {
        return Some(SendTarget::Dm(peer.to_string()));
    }
    if let Some(group) = session_id.strip_prefix("signal:group:") {
        return Some(SendTarget::Group(group.to_string()));
    }
    None
}

/// Split `text` into chunks of at most `limit` characters, preferring to
/// break at newlines when one falls in the trailing half of the window.
fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let window_end = (start + limit).min(chars.len());
        let mut end = window_end;
        if window_end < chars.len() {
            if let Some(newline) = (start..window_end).rev().find(|&k| chars[k] == '\n') {
                if newline > start + limit / 2 {
                    end = newline + 1;
                }
            }
        }
        let chunk: String = chars[start..end].iter().collect();
        chunks.push(chunk.trim_end_matches('\n').to_string());
        start = end;
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rpc::{DataMessage, GroupInfo};

    fn config(dm: AccessPolicy, group: AccessPolicy, allowlist: Vec<&str>) -> SignalConfig {
        let mut cfg = SignalConfig::default();
        cfg.account = "+1000".into();
        cfg.dm_policy = dm;
        cfg.group_policy = group;
        cfg.allowlist = allowlist.into_iter().map(str::to_string).collect();
        cfg.text_chunk_limit = 2000;
        cfg
    }

    fn dm_envelope(number: &str, uuid: &str, message: &str) -> Envelope {
        Envelope {
            source_number: Some(number.into()),
            source_uuid: Some(uuid.into()),
            data_message: Some(DataMessage {
                message: Some(message.into()),
                group_info: None,
                mentions: vec![],
            }),
        }
    }

    fn group_envelope(group_id: &str, message: &str) -> Envelope {
        Envelope {
            source_number: Some("+2000".into()),
            source_uuid: Some("peer-uuid".into()),
            data_message: Some(DataMessage {
                message: Some(message.into()),
                group_info: Some(GroupInfo {
                    group_id: group_id.into(),
                }),
                mentions: vec![],
            }),
        }
    }

    // ── Classification ────────────────────────────────────────────────────────

    #[test]
    fn open_dm_maps_to_uuid_session() {
        let cfg = config(AccessPolicy::Open, AccessPolicy::Disabled, vec![]);
        let inbound = classify(&cfg, &dm_envelope("+2000", "u-42", "hello")).unwrap();
        assert_eq!(inbound.session_id, "signal:dm:u-42");
        assert_eq!(inbound.content, "hello");
    }

    #[test]
    fn self_message_is_dropped() {
        let cfg = config(AccessPolicy::Open, AccessPolicy::Open, vec![]);
        assert!(classify(&cfg, &dm_envelope("+1000", "self-uuid", "echo")).is_none());
    }

    #[test]
    fn envelope_without_data_message_is_dropped() {
        let cfg = config(AccessPolicy::Open, AccessPolicy::Open, vec![]);
        let envelope = Envelope {
            source_number: Some("+2000".into()),
            source_uuid: Some("u".into()),
            data_message: None,
        };
        assert!(classify(&cfg, &envelope).is_none());
    }

    #[test]
    fn disabled_dm_policy_rejects() {
        let cfg = config(AccessPolicy::Disabled, AccessPolicy::Open, vec![]);
        assert!(classify(&cfg, &dm_envelope("+2000", "u", "hi")).is_none());
    }

    #[test]
    fn dm_allowlist_matches_number_or_uuid() {
        let by_number = config(AccessPolicy::Allowlist, AccessPolicy::Open, vec!["+2000"]);
        assert!(classify(&by_number, &dm_envelope("+2000", "u", "hi")).is_some());

        let by_uuid = config(AccessPolicy::Allowlist, AccessPolicy::Open, vec!["u-9"]);
        assert!(classify(&by_uuid, &dm_envelope("+3000", "u-9", "hi")).is_some());

        let neither = config(AccessPolicy::Allowlist, AccessPolicy::Open, vec!["other"]);
        assert!(classify(&neither, &dm_envelope("+3000", "u-9", "hi")).is_none());
    }

    #[test]
    fn group_session_and_allowlist_by_group_id() {
        let open = config(AccessPolicy::Disabled, AccessPolicy::Open, vec![]);
        let inbound = classify(&open, &group_envelope("g-1", "hey")).unwrap();
        assert_eq!(inbound.session_id, "signal:group:g-1");

        let listed = config(AccessPolicy::Disabled, AccessPolicy::Allowlist, vec!["g-1"]);
        assert!(classify(&listed, &group_envelope("g-1", "hey")).is_some());
        assert!(classify(&listed, &group_envelope("g-2", "hey")).is_none());
    }

    // ── Mentions ──────────────────────────────────────────────────────────────

    #[test]
    fn mention_placeholder_is_replaced() {
        let mentions = vec![Mention {
            start: 0,
            length: 1,
            uuid: Some("u-7".into()),
            number: None,
        }];
        assert_eq!(render_mentions("\u{fffc} hello", &mentions), "@u-7 hello");
    }

    #[test]
    fn multiple_mentions_apply_back_to_front() {
        let mentions = vec![
            Mention {
                start: 0,
                length: 1,
                uuid: None,
                number: Some("+1".into()),
            },
            Mention {
                start: 2,
                length: 1,
                uuid: None,
                number: Some("+2".into()),
            },
        ];
        assert_eq!(render_mentions("\u{fffc} \u{fffc}", &mentions), "@+1 @+2");
    }

    // ── Session targets ───────────────────────────────────────────────────────

    #[test]
    fn session_targets_round_trip() {
        match parse_session_target("signal:dm:u-1").unwrap() {
            SendTarget::Dm(peer) => assert_eq!(peer, "u-1"),
            other => panic!("wrong target {other:?}"),
        }
        match parse_session_target("signal:group:g-1").unwrap() {
            SendTarget::Group(group) => assert_eq!(group, "g-1"),
            other => panic!("wrong target {other:?}"),
        }
        assert!(parse_session_target("webhook:x").is_none());
    }

    // ── Chunking ──────────────────────────────────────────────────────────────

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn long_text_prefers_newline_breaks() {
        let text = format!("{}\n{}", "a".repeat(80), "b".repeat(80));
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(80));
        assert_eq!(chunks[1], "b".repeat(80));
    }

    #[test]
    fn hard_break_without_newline() {
        let text = "x".repeat(250);
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 100);
        assert_eq!(chunks[2].chars().count(), 50);
    }

    #[test]
    fn every_chunk_respects_limit() {
        let text = (0..40)
            .map(|i| format!("line number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        for chunk in chunk_text(&text, 50) {
            assert!(chunk.chars().count() <= 50);
        }
    }
}
