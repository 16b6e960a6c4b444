// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Label applied to the sidecar so leftovers from a crashed run can be
/// garbage-collected at the next startup.
pub const SANDBOX_LABEL: &str = "miclaw.sandbox=1";

/// Fixed path the agent binary is mounted at inside the container.
pub const SANDBOX_BINARY_PATH: &str = "/usr/local/bin/miclaw";

const DEFAULT_IMAGE: &str = "debian:bookworm-slim";

/// Everything needed to start the sidecar.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Docker network name; "none" isolates the container.
    pub network: String,
    /// `uid:gid` the container runs as; `None` uses the invoking user.
    pub user: Option<String>,
    /// Host path of the agent binary (mounted read-only).
    pub binary: PathBuf,
    /// Workspace directory, mounted read-write at its host path so tool
    /// paths mean the same thing on both sides.
    pub workspace: PathBuf,
    /// Additional `(host, container, read_only)` mounts from config.
    pub mounts: Vec<(PathBuf, PathBuf, bool)>,
    /// Shim directory + broker socket, mounted when host commands are
    /// enabled.
    pub shim_dir: Option<PathBuf>,
    pub broker_socket: Option<PathBuf>,
    pub image: Option<String>,
}

/// A running long-lived sidecar container.
pub struct SandboxContainer {
    id: String,
}

impl SandboxContainer {
    /// Start the sidecar detached.  The entrypoint is a sleep loop that
    /// exits cleanly on TERM.
    pub async fn start(spec: &SandboxSpec) -> anyhow::Result<Self> {
        gc_leftovers().await;

        let uid_gid = match &spec.user {
            Some(u) => u.clone(),
            None => current_uid_gid(),
        };

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--init".into(),
            "--label".into(),
            SANDBOX_LABEL.into(),
            "--user".into(),
            uid_gid,
            format!("--network={}", spec.network),
        ];

        args.push("-v".into());
        args.push(format!(
            "{}:{}:ro",
            spec.binary.display(),
            SANDBOX_BINARY_PATH
        ));
        args.push("-v".into());
        args.push(format!(
            "{}:{}:rw",
            spec.workspace.display(),
            spec.workspace.display()
        ));
        for (host, container, ro) in &spec.mounts {
            let mode = if *ro { "ro" } else { "rw" };
            args.push("-v".into());
            args.push(format!("{}:{}:{mode}", host.display(), container.display()));
        }
        if let Some(shim_dir) = &spec.shim_dir {
            args.push("-v".into());
            args.push(format!("{}:/opt/miclaw/host-bin:ro", shim_dir.display()));
        }
        if let Some(socket) = &spec.broker_socket {
            args.push("-v".into());
            args.push(format!(
                "{}:/opt/miclaw/host-executor.sock:rw",
                socket.display()
            ));
            args.push("-e".into());
            args.push(format!(
                "{}=/opt/miclaw/host-executor.sock",
                crate::ENV_EXECUTOR_SOCK
            ));
            args.push("-e".into());
            args.push("PATH=/opt/miclaw/host-bin:/usr/local/bin:/usr/bin:/bin".into());
        }
        args.push("-e".into());
        args.push(format!("{}=1", crate::ENV_SANDBOX_CHILD));
        args.push("-w".into());
        args.push(spec.workspace.display().to_string());

        args.push(spec.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.into()));
        // Sleep loop entrypoint; `sh` forwards TERM so `docker stop` is
        // clean and fast.
        args.push("sh".into());
        args.push("-c".into());
        args.push("while true; do sleep 3600; done".into());

        debug!(?args, "starting sandbox container");
        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .context("failed to run docker")?;

        if !output.status.success() {
            bail!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = parse_container_id(&stdout)?;
        info!(container_id = %id, "sandbox container started");
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop the container with a 2-second grace before SIGKILL.
    pub async fn close(&self) {
        debug!(container_id = %self.id, "stopping sandbox container");
        let result = Command::new("docker")
            .args(["stop", "-t", "2", &self.id])
            .output()
            .await;
        if let Err(e) = result {
            warn!(container_id = %self.id, "docker stop failed: {e}");
        }
    }
}

/// Remove labeled containers left behind by a previous run that did not
/// shut down cleanly.
pub async fn gc_leftovers() {
    let list = Command::new("docker")
        .args(["ps", "-aq", "--filter"])
        .arg(format!("label={SANDBOX_LABEL}"))
        .output()
        .await;
    let Ok(list) = list else { return };
    for id in String::from_utf8_lossy(&list.stdout).split_whitespace() {
        warn!(container_id = %id, "removing leftover sandbox container");
        let _ = Command::new("docker").args(["rm", "-f", id]).output().await;
    }
}

/// Extract the container id from `docker run -d` output.  The id must be
/// the last non-blank line and must not contain whitespace; anything else
/// means docker printed something unexpected (pull progress, warnings).
fn parse_container_id(stdout: &str) -> anyhow::Result<String> {
    let last = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(str::trim)
        .unwrap_or("");
    if last.is_empty() || last.chars().any(char::is_whitespace) {
        bail!("could not parse container id from docker output: {stdout:?}");
    }
    Ok(last.to_string())
}

fn current_uid_gid() -> String {
    #[cfg(unix)]
    unsafe {
        format!("{}:{}", libc::getuid(), libc::getgid())
    }
    #[cfg(not(unix))]
    {
        "1000:1000".to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_is_last_nonblank_line() {
        let out = "Unable to find image locally\nPulling...\nabc123def456\n\n";
        assert_eq!(parse_container_id(out).unwrap(), "abc123def456");
    }

    #[test]
    fn id_with_whitespace_is_rejected() {
        assert!(parse_container_id("warning: something happened\n").is_err());
    }

    #[test]
    fn empty_output_is_rejected() {
        assert!(parse_container_id("\n\n").is_err());
    }
}
