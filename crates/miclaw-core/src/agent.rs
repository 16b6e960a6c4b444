// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent: a supervisor owning one actor per session.
//!
//! Each session has a bounded mailbox and exactly one loop task, so
//! transcript writes are serialized without locks; across sessions the
//! actors run in parallel.  The actor drives the per-turn cycle: pull an
//! input, maybe compact, stream one model turn, fan out tool calls, persist
//! and publish, and repeat while the model keeps calling tools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use miclaw_provider::{
    CompletionRequest, Message, Part, Provider, ProviderEvent, ToolSchema, Usage,
};
use miclaw_store::{Session, SessionStore};
use miclaw_tools::{ToolCall, ToolRegistry, ToolResult};

use crate::{
    build_system_prompt,
    compact::{
        build_compacted_history, last_user_text, repair_dangling_tool_calls,
        trim_to_assistant_tail, SUMMARIZE_PROMPT,
    },
    AgentEvent, EventBus, Input, PromptContext,
};

/// Knobs for the session scheduler.  Defaults match production behavior;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct AgentTuning {
    pub mailbox_capacity: usize,
    /// How long `enqueue` blocks on a full mailbox before dropping.
    pub enqueue_timeout: Duration,
    /// Parallel tool executions per turn.
    pub tool_fanout: usize,
    /// Estimated-token threshold that triggers compaction.
    pub compaction_threshold: usize,
    /// Ceiling for one streaming model turn.
    pub turn_deadline: Duration,
    /// Safety bound on tool rounds per input.
    pub max_tool_rounds: u32,
}

impl Default for AgentTuning {
    fn default() -> Self {
        Self {
            mailbox_capacity: 16,
            enqueue_timeout: Duration::from_millis(200),
            tool_fanout: 4,
            compaction_threshold: 200_000,
            turn_deadline: Duration::from_secs(12 * 60),
            max_tool_rounds: 64,
        }
    }
}

struct Shared {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    store: Arc<SessionStore>,
    bus: EventBus,
    tuning: AgentTuning,
    prompt: Mutex<PromptContext>,
    sessions: Mutex<HashMap<String, mpsc::Sender<Input>>>,
    /// Number of session loops currently mid-turn.
    active: AtomicUsize,
    cancel_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Agent {
    shared: Arc<Shared>,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        store: Arc<SessionStore>,
        tuning: AgentTuning,
    ) -> Self {
        Self::with_bus(provider, tools, store, tuning, EventBus::new())
    }

    /// Like [`Agent::new`] but publishing on an externally created bus, so
    /// collaborators wired up before the agent (e.g. the `message` tool)
    /// can share it.
    pub fn with_bus(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        store: Arc<SessionStore>,
        tuning: AgentTuning,
        bus: EventBus,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                provider,
                tools,
                store,
                bus,
                tuning,
                prompt: Mutex::new(PromptContext::default()),
                sessions: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                cancel_tx,
            }),
        }
    }

    /// The fan-out event bus; subscribe for `Delta`/`Tool`/`Response`/
    /// `Error` events.
    pub fn events(&self) -> EventBus {
        self.shared.bus.clone()
    }

    /// Hand an input to its session's mailbox, spawning the session loop
    /// on first contact.  Blocks briefly on a full mailbox, then drops
    /// with a logged error — never silently, never indefinitely.
    pub async fn enqueue(&self, input: Input) {
        if input.session_id.is_empty() || input.content.trim().is_empty() {
            warn!(session_id = %input.session_id, "discarding empty input");
            return;
        }
        if *self.shared.cancel_tx.borrow() {
            warn!(session_id = %input.session_id, "agent is shutting down, dropping input");
            return;
        }
        let tx = self.session_sender(&input.session_id);
        let session_id = input.session_id.clone();
        match tokio::time::timeout(self.shared.tuning.enqueue_timeout, tx.send(input)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!(session_id = %session_id, "session mailbox closed, input dropped"),
            Err(_) => error!(session_id = %session_id, "session mailbox full, input dropped"),
        }
    }

    /// Signal every session to wind down after its current turn.
    pub fn cancel(&self) {
        info!("agent cancel requested");
        let _ = self.shared.cancel_tx.send(true);
    }

    /// True while any session loop is mid-turn.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst) > 0
    }

    pub fn set_workspace(&self, workspace: impl Into<String>) {
        self.shared.prompt.lock().expect("prompt mutex poisoned").workspace =
            Some(workspace.into());
    }

    pub fn set_skills(&self, skills: Vec<String>) {
        self.shared.prompt.lock().expect("prompt mutex poisoned").skills = skills;
    }

    pub fn set_memory_note(&self, note: impl Into<String>) {
        self.shared.prompt.lock().expect("prompt mutex poisoned").memory_note =
            Some(note.into());
    }

    fn session_sender(&self, session_id: &str) -> mpsc::Sender<Input> {
        let mut sessions = self.shared.sessions.lock().expect("session map poisoned");
        if let Some(tx) = sessions.get(session_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(self.shared.tuning.mailbox_capacity);
        let actor = SessionActor {
            shared: self.shared.clone(),
            session_id: session_id.to_string(),
            messages: Vec::new(),
        };
        tokio::spawn(actor.run(rx));
        sessions.insert(session_id.to_string(), tx.clone());
        debug!(session_id, "session actor spawned");
        tx
    }
}

#[async_trait::async_trait]
impl crate::InputSink for Agent {
    async fn enqueue(&self, input: Input) {
        Agent::enqueue(self, input).await;
    }
}

/// Decrements the active-turn counter even if the turn panics.
struct ActiveGuard(Arc<Shared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What one streamed model turn produced.
#[derive(Default)]
struct TurnOutcome {
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    aborted: bool,
    stream_error: Option<String>,
}

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

struct SessionActor {
    shared: Arc<Shared>,
    session_id: String,
    /// In-memory transcript; this actor is its only writer.
    messages: Vec<Message>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Input>) {
        match self.shared.store.list_by_session(&self.session_id, 0, 0) {
            Ok(messages) => self.messages = messages,
            Err(e) => {
                error!(session_id = %self.session_id, "cannot load transcript: {e}");
                return;
            }
        }
        let mut cancel_rx = self.shared.cancel_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
                input = rx.recv() => {
                    let Some(input) = input else { break };
                    self.shared.active.fetch_add(1, Ordering::SeqCst);
                    let _guard = ActiveGuard(self.shared.clone());
                    if let Err(e) = self.handle_input(input, &mut cancel_rx).await {
                        error!(session_id = %self.session_id, "turn failed: {e:#}");
                        self.shared
                            .bus
                            .publish(AgentEvent::error(&self.session_id, format!("{e:#}")));
                    }
                    // A cancellation consumed mid-turn never wakes the
                    // select arm above again; check the flag directly.
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(session_id = %self.session_id, "session actor stopped");
    }

    /// One input: a user message followed by as many model turns as the
    /// tool protocol requires.
    async fn handle_input(
        &mut self,
        input: Input,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut session = self.ensure_session()?;

        let user = Message::user(&self.session_id, &input.content);
        self.shared.store.create_message(&user)?;
        self.messages.push(user);

        if session.title.is_empty() {
            session.title = input.content.chars().take(80).collect();
        }

        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds > self.shared.tuning.max_tool_rounds {
                warn!(session_id = %self.session_id, "tool round budget exhausted");
                break;
            }

            self.maybe_compact(&mut session).await?;

            let outcome = self.stream_turn(cancel_rx).await?;

            // Persist the assistant message even when the stream failed or
            // was aborted so the transcript stays self-consistent.
            let assistant = self.build_assistant_message(&outcome);
            let has_parts = !assistant.parts.is_empty();
            if has_parts {
                self.shared.store.create_message(&assistant)?;
                self.messages.push(assistant.clone());
            }

            if let Some(usage) = &outcome.usage {
                session.prompt_tokens += usage.prompt_tokens as u64;
                session.completion_tokens += usage.completion_tokens as u64;
                session.cost += usage.cost;
            }

            let had_tool_calls = !outcome.tool_calls.is_empty();
            if had_tool_calls {
                self.shared.bus.publish(AgentEvent::tool(assistant.clone()));
                let results = self.execute_tools(&outcome.tool_calls, cancel_rx).await;
                for result in &results {
                    let message = Message::tool_result(
                        &self.session_id,
                        &result.tool_call_id,
                        &result.content,
                        result.is_error,
                    );
                    self.shared.store.create_message(&message)?;
                    self.messages.push(message);
                }
            }

            session.message_count = self.shared.store.count_by_session(&self.session_id)?;
            self.shared.store.update_session(&session)?;

            if has_parts {
                self.shared.bus.publish(AgentEvent::response(assistant));
            }

            if let Some(stream_error) = outcome.stream_error {
                self.shared
                    .bus
                    .publish(AgentEvent::error(&self.session_id, stream_error));
                break;
            }
            if outcome.aborted || *cancel_rx.borrow() {
                break;
            }
            if !had_tool_calls {
                break;
            }
        }
        Ok(())
    }

    fn ensure_session(&self) -> anyhow::Result<Session> {
        if let Some(session) = self.shared.store.get_session(&self.session_id)? {
            return Ok(session);
        }
        let session = Session::new(&self.session_id);
        self.shared.store.create_session(&session)?;
        info!(session_id = %self.session_id, "session created");
        Ok(session)
    }

    fn system_prompt(&self) -> String {
        let ctx = self
            .shared
            .prompt
            .lock()
            .expect("prompt mutex poisoned")
            .clone();
        build_system_prompt(&ctx)
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.shared
            .tools
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect()
    }

    // ── Turn streaming ────────────────────────────────────────────────────────

    async fn stream_turn(
        &mut self,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<TurnOutcome> {
        let request = CompletionRequest {
            system: self.system_prompt(),
            messages: self.messages.clone(),
            tools: self.tool_schemas(),
            max_tokens: None,
        };

        // One retry with a short backoff on transport failure before the
        // turn is surfaced as an error.
        let mut stream = match self.shared.provider.stream(request.clone()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(session_id = %self.session_id, "provider request failed, retrying: {e:#}");
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.shared.provider.stream(request).await?
            }
        };

        let deadline = tokio::time::Instant::now() + self.shared.tuning.turn_deadline;
        let mut outcome = TurnOutcome::default();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        outcome.aborted = true;
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    outcome.stream_error = Some("turn deadline exceeded".into());
                    break;
                }
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            match event {
                Ok(ProviderEvent::ContentDelta(delta)) => {
                    outcome.text.push_str(&delta);
                    self.shared
                        .bus
                        .publish(AgentEvent::delta(&self.session_id, delta));
                }
                Ok(ProviderEvent::ReasoningDelta(delta)) => {
                    outcome.reasoning.push_str(&delta);
                }
                Ok(ProviderEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                }) => {
                    let entry = pending.entry(index).or_insert_with(|| PendingToolCall {
                        id: String::new(),
                        name: String::new(),
                        args_buf: String::new(),
                    });
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.args_buf.push_str(&arguments);
                }
                Ok(ProviderEvent::Usage(usage)) => outcome.usage = Some(usage),
                Ok(ProviderEvent::Complete { reason }) => {
                    outcome.finish_reason = Some(reason);
                    break;
                }
                Ok(ProviderEvent::Error(e)) => {
                    warn!(session_id = %self.session_id, "provider stream warning: {e}");
                }
                Err(e) => {
                    outcome.stream_error = Some(format!("{e:#}"));
                    break;
                }
            }
        }

        // Flush accumulated parallel tool calls in index order.  A call
        // with no name cannot be dispatched and is dropped; an empty id
        // gets a synthetic one so the pairing invariant can still hold.
        let mut flushed: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        flushed.sort_by_key(|(index, _)| *index);
        for (i, (_, entry)) in flushed.into_iter().enumerate() {
            if entry.name.is_empty() {
                warn!(session_id = %self.session_id, "dropping tool call with empty name");
                continue;
            }
            let parameters = if entry.args_buf.is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                match serde_json::from_str(&entry.args_buf) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            session_id = %self.session_id,
                            tool = %entry.name,
                            "invalid tool arguments from model, substituting {{}}: {e}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                }
            };
            let id = if entry.id.is_empty() {
                format!("tc_synthetic_{i}")
            } else {
                entry.id
            };
            outcome.tool_calls.push(ToolCall::new(id, entry.name, parameters));
        }

        Ok(outcome)
    }

    fn build_assistant_message(&self, outcome: &TurnOutcome) -> Message {
        let mut parts: Vec<Part> = Vec::new();
        if !outcome.reasoning.is_empty() {
            parts.push(Part::Reasoning {
                text: outcome.reasoning.clone(),
            });
        }
        if !outcome.text.is_empty() {
            parts.push(Part::Text {
                text: outcome.text.clone(),
            });
        }
        for call in &outcome.tool_calls {
            parts.push(Part::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                parameters: call.parameters.clone(),
            });
        }
        if let Some(reason) = &outcome.finish_reason {
            parts.push(Part::Finish {
                reason: reason.clone(),
            });
        }
        Message::assistant(&self.session_id, parts)
    }

    // ── Tool fan-out ──────────────────────────────────────────────────────────

    /// Run the turn's tool calls in parallel (bounded fan-out) and return
    /// results in the calls' declared order.  Panics and infrastructure
    /// errors become error results; they never abort the loop.
    async fn execute_tools(
        &self,
        calls: &[ToolCall],
        cancel_rx: &watch::Receiver<bool>,
    ) -> Vec<ToolResult> {
        let fanout = self.shared.tuning.tool_fanout.max(1);
        futures::stream::iter(calls.iter().cloned().map(|call| {
            let registry = self.shared.tools.clone();
            let mut cancel = cancel_rx.clone();
            async move {
                let call_id = call.id.clone();
                let name = call.name.clone();
                // An already-landed cancellation must be honored before any
                // work starts: the cancel flag flips false→true exactly
                // once, and a cloned watch receiver has that change marked
                // seen, so `changed()` below would never resolve for it.
                if *cancel.borrow() {
                    return ToolResult::err(&call_id, "tool cancelled by shutdown");
                }
                debug!(tool = %name, call_id = %call_id, "dispatching tool");
                let task = tokio::spawn(async move { registry.execute(&call).await });
                tokio::select! {
                    _ = cancel.changed() => {
                        ToolResult::err(&call_id, "tool cancelled by shutdown")
                    }
                    joined = task => match joined {
                        Ok(Ok(result)) => result,
                        Ok(Err(infra)) => {
                            warn!(tool = %name, "tool infrastructure error: {infra:#}");
                            ToolResult::err(&call_id, format!("tool failed: {infra:#}"))
                        }
                        Err(join_error) => {
                            error!(tool = %name, "tool panicked: {join_error}");
                            ToolResult::err(&call_id, format!("tool panicked: {join_error}"))
                        }
                    },
                }
            }
        }))
        .buffered(fanout)
        .collect()
        .await
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    /// Replace an oversized transcript with a single structured summary,
    /// preserving the last user intent and all tool pairings.
    async fn maybe_compact(&mut self, session: &mut Session) -> anyhow::Result<()> {
        let system = self.system_prompt();
        let estimate: usize =
            system.len() / 4 + self.messages.iter().map(|m| m.approx_tokens()).sum::<usize>();
        if estimate <= self.shared.tuning.compaction_threshold || self.messages.len() < 3 {
            return Ok(());
        }
        info!(
            session_id = %self.session_id,
            estimate, "context over threshold, compacting"
        );

        repair_dangling_tool_calls(&mut self.messages);
        let last_user = last_user_text(&self.messages);
        trim_to_assistant_tail(&mut self.messages);

        let mut summarize_input = self.messages.clone();
        summarize_input.push(Message::user(&self.session_id, SUMMARIZE_PROMPT));
        let request = CompletionRequest {
            system: String::new(),
            messages: summarize_input,
            tools: Vec::new(),
            max_tokens: None,
        };
        let summary = collect_text(self.shared.provider.stream(request).await?).await?;
        if summary.trim().is_empty() {
            warn!(session_id = %self.session_id, "empty compaction summary, keeping history");
            return Ok(());
        }

        let history = build_compacted_history(&self.session_id, &summary, last_user.as_deref());
        self.shared
            .store
            .replace_session_messages(&self.session_id, &history)?;
        session.summary_message_id = Some(history[0].id.clone());
        self.messages = history;

        // Probe the provider for an accurate count of the compacted
        // context (max output 16); the result feeds logs and stats only.
        let probe = CompletionRequest {
            system: self.system_prompt(),
            messages: self.messages.clone(),
            tools: Vec::new(),
            max_tokens: None,
        };
        match self.shared.provider.count_tokens(probe).await {
            Ok(tokens) => {
                info!(session_id = %self.session_id, tokens, "compaction complete");
                session.prompt_tokens = session.prompt_tokens.max(tokens as u64);
            }
            Err(e) => warn!(session_id = %self.session_id, "token probe failed: {e:#}"),
        }
        Ok(())
    }
}

async fn collect_text(mut stream: miclaw_provider::EventStream) -> anyhow::Result<String> {
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        if let ProviderEvent::ContentDelta(delta) = event? {
            text.push_str(&delta);
        }
    }
    Ok(text)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
