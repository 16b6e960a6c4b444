// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolResult};
use crate::truncate::{head_tail_truncate, OUTPUT_LIMIT_BYTES};

/// Per-process output buffer cap; older output is discarded from the front.
const BUFFER_CAP: usize = 256 * 1024;

struct Managed {
    command: String,
    child: tokio::process::Child,
    output: Arc<Mutex<String>>,
}

/// Registry of background processes started through the `exec` tool.
///
/// Host-only: the sandbox bridge drops the `process` tool entirely, so
/// nothing in the container can reach this state.
pub struct ProcessManager {
    procs: Mutex<HashMap<u64, Managed>>,
    next_id: AtomicU64,
}

impl ProcessManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            procs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn start(&self, command: &str, workdir: &Path) -> anyhow::Result<u64> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        cmd.current_dir(workdir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        let mut child = cmd.spawn()?;

        let output = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, output.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(process_id = id, cmd = %command, "background process started");
        self.procs.lock().expect("process map poisoned").insert(
            id,
            Managed {
                command: command.to_string(),
                child,
                output,
            },
        );
        Ok(id)
    }

    pub fn list(&self) -> Vec<(u64, String, bool)> {
        let mut procs = self.procs.lock().expect("process map poisoned");
        let mut out: Vec<(u64, String, bool)> = procs
            .iter_mut()
            .map(|(id, m)| {
                let running = matches!(m.child.try_wait(), Ok(None));
                (*id, m.command.clone(), running)
            })
            .collect();
        out.sort_by_key(|(id, ..)| *id);
        out
    }

    /// Current status plus accumulated output.  Finished processes stay
    /// listed until killed/removed so their output can still be read.
    pub fn poll(&self, id: u64) -> Option<(Option<i32>, String)> {
        let mut procs = self.procs.lock().expect("process map poisoned");
        let m = procs.get_mut(&id)?;
        let exit = match m.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            _ => None,
        };
        let output = m.output.lock().expect("output buffer poisoned").clone();
        Some((exit, output))
    }

    pub fn kill(&self, id: u64) -> bool {
        let mut procs = self.procs.lock().expect("process map poisoned");
        match procs.remove(&id) {
            Some(mut m) => {
                let _ = m.child.start_kill();
                true
            }
            None => false,
        }
    }

    /// Kill everything still running (shutdown path).
    pub fn kill_all(&self) {
        let mut procs = self.procs.lock().expect("process map poisoned");
        for (_, mut m) in procs.drain() {
            let _ = m.child.start_kill();
        }
    }
}

async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, buf: Arc<Mutex<String>>) {
    let mut bytes = [0u8; 4096];
    loop {
        match reader.read(&mut bytes).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut out = buf.lock().expect("output buffer poisoned");
                out.push_str(&String::from_utf8_lossy(&bytes[..n]));
                if out.len() > BUFFER_CAP {
                    let cut = out.len() - BUFFER_CAP;
                    let cut = (cut..out.len()).find(|i| out.is_char_boundary(*i)).unwrap_or(cut);
                    out.drain(..cut);
                }
            }
        }
    }
}

/// Tool surface over [`ProcessManager`]: list, poll, kill.
pub struct ProcessTool {
    pub manager: Arc<ProcessManager>,
}

#[async_trait]
impl Tool for ProcessTool {
    fn name(&self) -> &str {
        "process"
    }

    fn description(&self) -> &str {
        "Manage background processes started with exec(background=true). \
         Actions: list, poll (status + output), kill."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["list", "poll", "kill"], "description": "What to do" },
                "id": { "type": "integer", "description": "Process id (required for poll/kill)" }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(action) = call.str_arg("action") else {
            return Ok(ToolResult::err(&call.id, "missing 'action'"));
        };
        match action {
            "list" => {
                let procs = self.manager.list();
                if procs.is_empty() {
                    return Ok(ToolResult::ok(&call.id, "(no background processes)"));
                }
                let lines: Vec<String> = procs
                    .into_iter()
                    .map(|(id, cmd, running)| {
                        let state = if running { "running" } else { "exited" };
                        format!("{id} [{state}] {cmd}")
                    })
                    .collect();
                Ok(ToolResult::ok(&call.id, lines.join("\n")))
            }
            "poll" => {
                let Some(id) = call.u64_arg("id") else {
                    return Ok(ToolResult::err(&call.id, "poll requires 'id'"));
                };
                match self.manager.poll(id) {
                    Some((exit, output)) => {
                        let header = match exit {
                            Some(code) => format!("[exited {code}]"),
                            None => "[running]".to_string(),
                        };
                        let body = head_tail_truncate(&output, OUTPUT_LIMIT_BYTES);
                        Ok(ToolResult::ok(&call.id, format!("{header}\n{body}")))
                    }
                    None => Ok(ToolResult::err(&call.id, format!("no such process: {id}"))),
                }
            }
            "kill" => {
                let Some(id) = call.u64_arg("id") else {
                    return Ok(ToolResult::err(&call.id, "kill requires 'id'"));
                };
                if self.manager.kill(id) {
                    Ok(ToolResult::ok(&call.id, format!("killed process {id}")))
                } else {
                    Ok(ToolResult::err(&call.id, format!("no such process: {id}")))
                }
            }
            other => Ok(ToolResult::err(&call.id, format!("unknown action: {other}"))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
