// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shim side of the host-command broker.
//!
//! Inside the container, `/opt/miclaw/host-bin` holds one symlink per
//! allowlisted command, all pointing at a single client script that
//! re-invokes the mounted agent binary in `--host-exec-client` mode with
//! the symlink's name as the command.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tracing::debug;

use crate::broker::{ExecuteRequest, ExecuteResponse};
use crate::container::SANDBOX_BINARY_PATH;
use crate::{ENV_EXECUTOR_SOCK, ENV_EXECUTOR_TIMEOUT};

const CLIENT_SCRIPT: &str = "host-exec-client";

/// Error that preserves the remote command's exit code so the shim process
/// can exit with it, making the bridged command indistinguishable from a
/// local one for scripts that check `$?`.
#[derive(Debug, thiserror::Error)]
#[error("host command exited with code {0}")]
pub struct ExitCodeError(pub i32);

/// Write the client script and one symlink per allowlisted command into
/// `dir`.  The directory is recreated from scratch so removed commands do
/// not leave stale shims behind.
pub fn install_shims(dir: &Path, commands: &[String]) -> anyhow::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).with_context(|| format!("clearing {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir)?;

    let script_path = dir.join(CLIENT_SCRIPT);
    let script = format!(
        "#!/bin/sh\nexec {SANDBOX_BINARY_PATH} --host-exec-client \"$(basename \"$0\")\" \"$@\"\n"
    );
    std::fs::write(&script_path, script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
    }

    for command in commands {
        #[cfg(unix)]
        std::os::unix::fs::symlink(CLIENT_SCRIPT, dir.join(command))
            .with_context(|| format!("linking shim for {command}"))?;
    }
    debug!(dir = %dir.display(), count = commands.len(), "installed host-command shims");
    Ok(())
}

/// Broker-client mode (`--host-exec-client <cmd> [args…]`).
///
/// Reads stdin to EOF, POSTs one JSON request to the broker socket, prints
/// the reported stdout/stderr faithfully, and returns the remote exit code
/// via [`ExitCodeError`].
pub async fn run_host_exec_client(command: &str, args: &[String]) -> anyhow::Result<()> {
    let socket = std::env::var(ENV_EXECUTOR_SOCK)
        .with_context(|| format!("{ENV_EXECUTOR_SOCK} is not set"))?;
    let timeout_sec = std::env::var(ENV_EXECUTOR_TIMEOUT)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(1800);

    // Stdin is piped by docker exec; an interactive tty never reaches the
    // shim.  Read to EOF so `git apply` style pipes work.
    let mut input = String::new();
    let _ = std::io::stdin().read_to_string(&mut input);

    let request = ExecuteRequest {
        command: command.to_string(),
        args: args.to_vec(),
        working_dir: std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .display()
            .to_string(),
        timeout_sec: Some(timeout_sec),
        container_id: std::env::var("HOSTNAME").unwrap_or_default(),
        input: if input.is_empty() { None } else { Some(input) },
    };

    let response = post_execute(Path::new(&socket), &request).await?;

    print!("{}", response.stdout);
    eprint!("{}", response.stderr);
    if let Some(error) = response.error {
        eprintln!("host-exec: {error}");
        return Err(ExitCodeError(1).into());
    }
    if response.exit_code != 0 {
        return Err(ExitCodeError(response.exit_code).into());
    }
    Ok(())
}

/// One HTTP/1.1 POST over the Unix socket.  Public because the runtime's
/// integration tests exercise the broker end-to-end through it.
pub async fn post_execute(socket: &Path, request: &ExecuteRequest) -> anyhow::Result<ExecuteResponse> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to broker at {}", socket.display()))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("broker handshake")?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let body = serde_json::to_vec(request)?;
    let http_request = hyper::Request::builder()
        .method("POST")
        .uri("/execute")
        .header("host", "miclaw-broker")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))?;

    let response = sender
        .send_request(http_request)
        .await
        .context("broker request")?;
    let bytes = response.into_body().collect().await?.to_bytes();
    serde_json::from_slice(&bytes).context("broker response body")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_creates_script_and_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("host-bin");
        install_shims(&dir, &["git".into(), "ssh".into()]).unwrap();

        let script = dir.join(CLIENT_SCRIPT);
        assert!(script.is_file());
        let content = std::fs::read_to_string(&script).unwrap();
        assert!(content.contains("--host-exec-client"));

        for cmd in ["git", "ssh"] {
            let link = dir.join(cmd);
            let target = std::fs::read_link(&link).unwrap();
            assert_eq!(target, PathBuf::from(CLIENT_SCRIPT));
        }
    }

    #[test]
    fn reinstall_drops_stale_shims() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("host-bin");
        install_shims(&dir, &["git".into()]).unwrap();
        install_shims(&dir, &["ssh".into()]).unwrap();
        assert!(!dir.join("git").exists());
        assert!(dir.join("ssh").exists());
    }

    #[tokio::test]
    async fn client_round_trips_through_broker_socket() {
        use crate::broker::HostExecutor;
        use tokio::sync::watch;

        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("exec.sock");
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();

        let executor = HostExecutor::new(
            vec!["echo".into()],
            vec![(PathBuf::from("/workspace"), ws.clone())],
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        let _handle = executor.serve(&sock, stop_rx).await.unwrap();

        let request = ExecuteRequest {
            command: "echo".into(),
            args: vec!["hello".into()],
            working_dir: "/workspace".into(),
            timeout_sec: Some(5),
            container_id: "test".into(),
            input: None,
        };
        let response = post_execute(&sock, &request).await.unwrap();
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.stdout.trim(), "hello");
    }

    #[test]
    fn exit_code_error_formats_code() {
        let e = ExitCodeError(124);
        assert!(e.to_string().contains("124"));
    }
}
