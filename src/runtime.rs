// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Runtime assembly and lifecycle.
//!
//! # Startup order (fail-fast)
//!
//! config → workspace/state dirs → session store → memory store + embed
//! client → provider → cron scheduler → sandbox bridge + broker → agent
//! with the composed toolset → background tasks (memory sync, scheduler,
//! signal pipeline, webhook server) → signal handler.
//!
//! # Shutdown order (strict)
//!
//! 1. `agent.cancel()` — stop accepting work, finish current streams.
//! 2. `scheduler.stop()` — no more cron firings.
//! 3. root cancel — channel adapters and broker wind down.
//! 4. join background tasks.
//! 5. poll until no session loop is mid-turn.
//! 6. close scheduler DB, memory store, session store, sandbox bridge.
//!
//! A watchdog force-exits with code 1 when shutdown hangs; a second
//! interrupt during shutdown does the same.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use miclaw_channels::{SignalPipeline, WebhookServer};
use miclaw_config::Config;
use miclaw_core::{Agent, AgentTuning, EventBus, InputSink, Source};
use miclaw_memory::{EmbedClient, Embedder, MemoryIndexer, MemoryStore};
use miclaw_provider::Message;
use miclaw_sandbox::{
    install_shims, wrap_for_sandbox, HostExecutor, SandboxContainer, SandboxSpec,
};
use miclaw_scheduler::CronScheduler;
use miclaw_store::SessionStore;
use miclaw_tools::{
    CronAddTool, CronListTool, CronRemoveTool, EditFileTool, ExecTool, GlobTool, GrepTool,
    ListDirTool, MemorySearchTool, MessageSink, MessageTool, ProcessManager, ProcessTool,
    ReadFileTool, SessionsHistoryTool, SessionsListTool, ToolRegistry, WriteFileTool,
};

/// Default watchdog for the whole shutdown sequence.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the shutdown sequence owns, in one place so the teardown
/// order is explicit and testable with mock components.
pub struct Runtime {
    pub agent: Agent,
    pub store: Arc<SessionStore>,
    pub memory: Option<Arc<MemoryStore>>,
    pub scheduler: Arc<CronScheduler>,
    pub sandbox: Option<SandboxHandles>,
    pub processes: Option<Arc<ProcessManager>>,
    pub root_cancel: watch::Sender<bool>,
    pub tasks: Vec<JoinHandle<()>>,
}

pub struct SandboxHandles {
    pub container: SandboxContainer,
    pub broker: Option<JoinHandle<()>>,
}

/// The `message` tool delivers through the same bus the channel adapters
/// already watch: a synthetic assistant response rides the normal
/// outbound path.
struct BusMessageSink {
    bus: EventBus,
}

#[async_trait::async_trait]
impl MessageSink for BusMessageSink {
    async fn send(&self, session_id: &str, text: &str) -> anyhow::Result<()> {
        let message = Message::assistant(
            session_id,
            vec![miclaw_provider::Part::Text { text: text.into() }],
        );
        self.bus.publish(miclaw_core::AgentEvent::response(message));
        Ok(())
    }
}

impl Runtime {
    /// Assemble and start everything the config enables.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let workspace = config
            .workspace_dir()
            .canonicalize()
            .or_else(|_| -> anyhow::Result<PathBuf> {
                std::fs::create_dir_all(config.workspace_dir())?;
                Ok(config.workspace_dir().canonicalize()?)
            })
            .context("resolving workspace directory")?;
        let state = config.state_dir();
        std::fs::create_dir_all(&state).context("creating state directory")?;

        let store = Arc::new(
            SessionStore::open(&state.join("sessions.sqlite")).context("opening session store")?,
        );

        let (memory, embedder) = if config.memory.enabled {
            std::fs::create_dir_all(state.join("memory"))?;
            let memory_store = Arc::new(
                MemoryStore::open(&state.join("memory/agent.sqlite"))
                    .context("opening memory store")?,
            );
            let embedder: Arc<dyn Embedder> = Arc::new(EmbedClient::new(
                &config.memory.embedding_url,
                config.memory.embedding_model.clone(),
                config.memory.embedding_api_key.clone(),
            ));
            (Some(memory_store), Some(embedder))
        } else {
            (None, None)
        };

        let provider = miclaw_provider::from_config(&config.provider)?;

        let scheduler =
            Arc::new(CronScheduler::open(&state.join("cron.sqlite")).context("opening cron db")?);

        // Tools are composed first so the sandbox bridge can substitute
        // proxies; the bus is shared with the message tool.
        let bus = EventBus::new();
        let processes = ProcessManager::new();
        let mut tools = build_toolset(ToolsetInputs {
            workspace: workspace.clone(),
            store: store.clone(),
            scheduler: scheduler.clone(),
            memory: memory.clone(),
            embedder: embedder.clone(),
            memory_config: &config.memory,
            processes: processes.clone(),
            bus: bus.clone(),
        });

        let (root_cancel, _) = watch::channel(false);
        let mut sandbox = None;
        if config.sandbox.enabled {
            let handles =
                start_sandbox(&config, &workspace, &state, root_cancel.subscribe()).await?;
            tools = wrap_for_sandbox(tools, handles.container.id());
            sandbox = Some(handles);
        }

        let agent = Agent::with_bus(
            provider,
            Arc::new(tools),
            store.clone(),
            AgentTuning::default(),
            bus,
        );
        agent.set_workspace(workspace.display().to_string());

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Memory sync runs detached: a failure is logged, never fatal, and
        // shutdown does not wait for a long first index.
        if let (Some(memory_store), Some(embedder)) = (memory.clone(), embedder) {
            let indexer = MemoryIndexer::new(memory_store, embedder, workspace.clone());
            tokio::spawn(async move {
                match indexer.sync().await {
                    Ok(stats) => info!(?stats, "memory sync complete"),
                    Err(e) => warn!("memory sync failed: {e:#}"),
                }
            });
        }

        // Cron scheduler.
        {
            let agent = agent.clone();
            let scheduler = scheduler.clone();
            tasks.push(tokio::spawn(scheduler.run(move |session_id, prompt| {
                let agent = agent.clone();
                async move {
                    agent
                        .enqueue(miclaw_core::Input::new(session_id, prompt, Source::Cron))
                        .await;
                }
            })));
        }

        // Signal pipeline.
        if config.signal.enabled {
            let pipeline = Arc::new(SignalPipeline::new(
                config.signal.clone(),
                Arc::new(agent.clone()) as Arc<dyn InputSink>,
            ));
            let events = agent.events();
            let cancel_rx = root_cancel.subscribe();
            tasks.push(tokio::spawn(pipeline.run(events, cancel_rx)));
        }

        // Webhook server.
        if config.webhook.enabled {
            let server = WebhookServer::new(
                config.webhook.clone(),
                Arc::new(agent.clone()) as Arc<dyn InputSink>,
            );
            let cancel_rx = root_cancel.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.serve(cancel_rx).await {
                    error!("webhook server failed: {e:#}");
                }
            }));
        }

        info!("miclaw runtime started");
        Ok(Self {
            agent,
            store,
            memory,
            scheduler,
            sandbox,
            processes: Some(processes),
            root_cancel,
            tasks,
        })
    }

    /// The strict teardown sequence.  `observe` is called with the name of
    /// each step as it begins (the shutdown test asserts the order).
    pub async fn shutdown(mut self, observe: impl Fn(&'static str)) {
        observe("agent.cancel");
        self.agent.cancel();

        observe("scheduler.stop");
        self.scheduler.stop();

        observe("cancel");
        let _ = self.root_cancel.send(true);

        observe("wait");
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("background task ended badly: {e}");
                }
            }
        }

        // Let in-flight turns drain their tool pairing obligations.
        while self.agent.is_active() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(processes) = &self.processes {
            processes.kill_all();
        }

        observe("scheduler.close");
        self.scheduler.close();

        if let Some(memory) = &self.memory {
            observe("memory.close");
            memory.close();
        }

        observe("store.close");
        self.store.close();

        if let Some(sandbox) = &self.sandbox {
            observe("sandbox.close");
            sandbox.container.close().await;
            if let Some(broker) = &sandbox.broker {
                broker.abort();
            }
        }

        eprintln!("shutdown complete");
    }

    /// Shutdown under the watchdog: a hung teardown force-exits with
    /// code 1 instead of wedging the process forever.
    pub async fn shutdown_with_watchdog(self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.shutdown(|_| {}))
            .await
            .is_err()
        {
            error!("shutdown watchdog expired, forcing exit");
            std::process::exit(1);
        }
    }
}

struct ToolsetInputs<'a> {
    workspace: PathBuf,
    store: Arc<SessionStore>,
    scheduler: Arc<CronScheduler>,
    memory: Option<Arc<MemoryStore>>,
    embedder: Option<Arc<dyn Embedder>>,
    memory_config: &'a miclaw_config::MemoryConfig,
    processes: Arc<ProcessManager>,
    bus: EventBus,
}

fn build_toolset(inputs: ToolsetInputs<'_>) -> ToolRegistry {
    let ws = inputs.workspace;
    let mut tools = ToolRegistry::new();
    tools.register(ReadFileTool {
        workspace: ws.clone(),
    });
    tools.register(WriteFileTool {
        workspace: ws.clone(),
    });
    tools.register(EditFileTool {
        workspace: ws.clone(),
    });
    tools.register(GrepTool {
        workspace: ws.clone(),
    });
    tools.register(GlobTool {
        workspace: ws.clone(),
    });
    tools.register(ListDirTool {
        workspace: ws.clone(),
    });
    tools.register(ExecTool {
        workspace: ws,
        manager: Some(inputs.processes.clone()),
    });
    tools.register(ProcessTool {
        manager: inputs.processes,
    });
    tools.register(MessageTool {
        sink: Arc::new(BusMessageSink { bus: inputs.bus }),
    });
    tools.register(SessionsListTool {
        store: inputs.store.clone(),
    });
    tools.register(SessionsHistoryTool {
        store: inputs.store,
    });
    tools.register(CronAddTool {
        scheduler: inputs.scheduler.clone(),
    });
    tools.register(CronListTool {
        scheduler: inputs.scheduler.clone(),
    });
    tools.register(CronRemoveTool {
        scheduler: inputs.scheduler,
    });
    if let (Some(memory), Some(embedder)) = (inputs.memory, inputs.embedder) {
        tools.register(MemorySearchTool {
            store: memory,
            embedder,
            min_score: inputs.memory_config.min_score,
            default_results: inputs.memory_config.default_results,
        });
    }
    tools
}

/// Start the sidecar container, shims, and broker per the sandbox config.
async fn start_sandbox(
    config: &Config,
    workspace: &PathBuf,
    state: &PathBuf,
    broker_shutdown: watch::Receiver<bool>,
) -> anyhow::Result<SandboxHandles> {
    let sandbox_dir = state.join("sandbox");
    std::fs::create_dir_all(&sandbox_dir)?;

    let host_commands = &config.sandbox.host_commands;
    let (shim_dir, socket_path, broker) = if host_commands.is_empty() {
        (None, None, None)
    } else {
        let shim_dir = sandbox_dir.join("host-bin");
        install_shims(&shim_dir, host_commands)?;

        let socket_dir = sandbox_dir.join("host-executor");
        std::fs::create_dir_all(&socket_dir)?;
        let socket_path = socket_dir.join("host-executor.sock");

        // Mount table for path translation: the workspace (mounted at its
        // host path) plus every user-declared mount.
        let mut mounts: Vec<(PathBuf, PathBuf)> = vec![(workspace.clone(), workspace.clone())];
        for mount in &config.sandbox.mounts {
            mounts.push((mount.container.clone(), mount.host.clone()));
        }
        let executor = HostExecutor::new(host_commands.clone(), mounts);
        let handle = executor.serve(&socket_path, broker_shutdown).await?;
        (Some(shim_dir), Some(socket_path), Some(handle))
    };

    let spec = SandboxSpec {
        network: config.sandbox.network.clone(),
        user: config.sandbox.host_user.clone(),
        binary: std::env::current_exe().context("locating agent binary")?,
        workspace: workspace.clone(),
        mounts: config
            .sandbox
            .mounts
            .iter()
            .map(|m| {
                (
                    m.host.clone(),
                    m.container.clone(),
                    m.mode == miclaw_config::MountMode::Ro,
                )
            })
            .collect(),
        shim_dir,
        broker_socket: socket_path,
        image: None,
    };
    let container = SandboxContainer::start(&spec)
        .await
        .context("starting sandbox container")?;

    Ok(SandboxHandles { container, broker })
}

/// Run until SIGINT/SIGTERM, then execute the shutdown protocol.  A second
/// signal during shutdown force-exits with code 1.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let runtime = Runtime::start(config).await?;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }

        // Second signal: force exit immediately.
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            eprintln!("second interrupt, forcing exit");
            std::process::exit(1);
        });
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    runtime.shutdown_with_watchdog(SHUTDOWN_TIMEOUT).await;
    Ok(())
}
