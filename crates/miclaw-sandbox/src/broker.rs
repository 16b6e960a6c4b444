// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Host-command broker.
//!
//! Lets the sandbox run a small allowlist of commands (`git`, `ssh`, build
//! tools) on the host without granting it network or host privileges.  The
//! broker is an HTTP server on a Unix-domain socket (mode 0600) mounted
//! into the container; shim executables inside the container POST one JSON
//! request per invocation.
//!
//! Policy, enforced in this order:
//! - the command must be a single token (no '/', no whitespace) in the
//!   allowlist, else 403;
//! - `working_dir` must be absolute and a descendant of a known container
//!   mount, else 400; it is rewritten to the corresponding host path;
//! - the child runs with a minimal environment and a deadline; timeout
//!   reports exit code 124.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::watch;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Cap on captured stdout/stderr per request.
const OUTPUT_CAP: usize = 1024 * 1024;

const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// Exit code reported for a timed-out command.
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: String,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub input: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The broker state: allowed commands and the container→host mount map,
/// sorted longest container path first so the most specific mount wins.
pub struct HostExecutor {
    allowlist: Vec<String>,
    mounts: Vec<(PathBuf, PathBuf)>,
}

impl HostExecutor {
    pub fn new(allowlist: Vec<String>, mut mounts: Vec<(PathBuf, PathBuf)>) -> Arc<Self> {
        mounts.sort_by_key(|(container, _)| std::cmp::Reverse(container.as_os_str().len()));
        Arc::new(Self { allowlist, mounts })
    }

    /// Bind the socket (0600) and serve until `shutdown` flips.  The socket
    /// file is removed first so a stale file from a crashed run cannot
    /// block the bind.
    pub async fn serve(
        self: Arc<Self>,
        socket_path: &Path,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(socket_path).await;
        let listener = UnixListener::bind(socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(socket = %socket_path.display(), "host-command broker listening");

        let app = Router::new()
            .route("/execute", post(execute_handler))
            .with_state(self);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _addr)) = accepted else { break };
                        let service = app.clone();
                        tokio::spawn(async move {
                            let socket = hyper_util::rt::TokioIo::new(stream);
                            let hyper_service = hyper::service::service_fn(
                                move |request: hyper::Request<hyper::body::Incoming>| {
                                    service
                                        .clone()
                                        .oneshot(request.map(axum::body::Body::new))
                                },
                            );
                            if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            )
                            .serve_connection(socket, hyper_service)
                            .await
                            {
                                debug!("broker connection ended: {e}");
                            }
                        });
                    }
                }
            }
            debug!("host-command broker stopped");
        });
        Ok(handle)
    }

    fn command_allowed(&self, command: &str) -> bool {
        !command.is_empty()
            && !command.contains('/')
            && !command.chars().any(char::is_whitespace)
            && self.allowlist.iter().any(|c| c == command)
    }

    /// Map an absolute container-side `working_dir` to its host path.
    fn translate_working_dir(&self, working_dir: &str) -> Option<PathBuf> {
        let wd = Path::new(working_dir);
        if !wd.is_absolute() {
            return None;
        }
        for (container, host) in &self.mounts {
            if let Ok(rest) = wd.strip_prefix(container) {
                return Some(host.join(rest));
            }
        }
        None
    }
}

async fn execute_handler(
    State(executor): State<Arc<HostExecutor>>,
    Json(req): Json<ExecuteRequest>,
) -> (StatusCode, Json<ExecuteResponse>) {
    debug!(command = %req.command, working_dir = %req.working_dir, "broker request");

    if !executor.command_allowed(&req.command) {
        warn!(command = %req.command, "broker rejected command");
        return error_response(
            StatusCode::FORBIDDEN,
            format!("command not allowed: {:?}", req.command),
        );
    }

    let Some(host_dir) = executor.translate_working_dir(&req.working_dir) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("working_dir outside known mounts: {:?}", req.working_dir),
        );
    };

    let timeout = Duration::from_secs(req.timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SECS).max(1));

    let mut cmd = Command::new(&req.command);
    cmd.args(&req.args);
    cmd.current_dir(&host_dir);
    // Minimal environment: the sandbox must not inherit host secrets.
    cmd.env_clear();
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    if let Ok(home) = std::env::var("HOME") {
        cmd.env("HOME", home);
    }
    if let Ok(user) = std::env::var("USER") {
        cmd.env("USER", user);
    }
    cmd.stdin(if req.input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("spawn failed: {e}"),
            )
        }
    };

    if let Some(input) = &req.input {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(input.as_bytes()).await;
            // Dropping stdin closes the pipe so the child sees EOF.
        }
    }

    let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
    match result {
        Ok(Ok(output)) => {
            let response = ExecuteResponse {
                stdout: cap_lossy(&output.stdout),
                stderr: cap_lossy(&output.stderr),
                exit_code: output.status.code().unwrap_or(-1),
                error: None,
            };
            (StatusCode::OK, Json(response))
        }
        Ok(Err(e)) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("wait failed: {e}"),
        ),
        Err(_) => (
            StatusCode::OK,
            Json(ExecuteResponse {
                stdout: String::new(),
                stderr: format!("timed out after {}s", timeout.as_secs()),
                exit_code: TIMEOUT_EXIT_CODE,
                error: None,
            }),
        ),
    }
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ExecuteResponse>) {
    (
        status,
        Json(ExecuteResponse {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            error: Some(message),
        }),
    )
}

fn cap_lossy(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= OUTPUT_CAP {
        return text.into_owned();
    }
    let mut cut = OUTPUT_CAP;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...[truncated]", &text[..cut])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> Arc<HostExecutor> {
        HostExecutor::new(
            vec!["pwd".into(), "git".into()],
            vec![
                (PathBuf::from("/workspace"), PathBuf::from("/tmp/host-ws")),
                (
                    PathBuf::from("/workspace/nested"),
                    PathBuf::from("/tmp/other"),
                ),
            ],
        )
    }

    // ── Allowlist ─────────────────────────────────────────────────────────────

    #[test]
    fn allowlisted_single_token_is_accepted() {
        assert!(executor().command_allowed("git"));
    }

    #[test]
    fn unlisted_command_is_rejected() {
        assert!(!executor().command_allowed("curl"));
    }

    #[test]
    fn path_or_whitespace_commands_are_rejected() {
        let e = executor();
        assert!(!e.command_allowed("/usr/bin/git"));
        assert!(!e.command_allowed("git push"));
        assert!(!e.command_allowed(""));
    }

    // ── Path translation ──────────────────────────────────────────────────────

    #[test]
    fn working_dir_maps_through_mount() {
        let host = executor().translate_working_dir("/workspace/sub").unwrap();
        assert_eq!(host, PathBuf::from("/tmp/host-ws/sub"));
    }

    #[test]
    fn longest_container_prefix_wins() {
        let host = executor()
            .translate_working_dir("/workspace/nested/deep")
            .unwrap();
        assert_eq!(host, PathBuf::from("/tmp/other/deep"));
    }

    #[test]
    fn mount_root_itself_maps() {
        let host = executor().translate_working_dir("/workspace").unwrap();
        assert_eq!(host, PathBuf::from("/tmp/host-ws"));
    }

    #[test]
    fn relative_working_dir_is_rejected() {
        assert!(executor().translate_working_dir("workspace/sub").is_none());
    }

    #[test]
    fn unmapped_absolute_dir_is_rejected() {
        assert!(executor().translate_working_dir("/etc").is_none());
    }

    // ── Handler ───────────────────────────────────────────────────────────────

    fn request(command: &str, working_dir: &str) -> ExecuteRequest {
        ExecuteRequest {
            command: command.into(),
            args: vec![],
            working_dir: working_dir.into(),
            timeout_sec: Some(5),
            container_id: "cid".into(),
            input: None,
        }
    }

    #[tokio::test]
    async fn forbidden_command_returns_403_without_forking() {
        let (status, Json(resp)) =
            execute_handler(State(executor()), Json(request("curl", "/workspace"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(resp.error.unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn unmapped_working_dir_returns_400() {
        let (status, Json(resp)) =
            execute_handler(State(executor()), Json(request("git", "/elsewhere"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(resp.error.unwrap().contains("outside known mounts"));
    }

    #[tokio::test]
    async fn pwd_runs_in_translated_host_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        let executor = HostExecutor::new(
            vec!["pwd".into()],
            vec![(PathBuf::from("/workspace"), tmp.path().to_path_buf())],
        );
        let (status, Json(resp)) =
            execute_handler(State(executor), Json(request("pwd", "/workspace/sub"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp.exit_code, 0);
        assert_eq!(
            resp.stdout.trim(),
            tmp.path().join("sub").display().to_string()
        );
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = HostExecutor::new(
            vec!["cat".into()],
            vec![(PathBuf::from("/workspace"), tmp.path().to_path_buf())],
        );
        let mut req = request("cat", "/workspace");
        req.input = Some("piped data".into());
        let (status, Json(resp)) = execute_handler(State(executor), Json(req)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp.stdout, "piped data");
    }

    #[tokio::test]
    async fn timeout_reports_exit_124() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = HostExecutor::new(
            vec!["sleep".into()],
            vec![(PathBuf::from("/workspace"), tmp.path().to_path_buf())],
        );
        let mut req = request("sleep", "/workspace");
        req.args = vec!["30".into()];
        req.timeout_sec = Some(1);
        let (status, Json(resp)) = execute_handler(State(executor), Json(req)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp.exit_code, 124);
    }

    #[tokio::test]
    async fn serve_binds_socket_with_0600() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("broker.sock");
        let executor = HostExecutor::new(vec![], vec![]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = executor.serve(&sock, stop_rx).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&sock).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        stop_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
