// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod broker;
mod container;
mod proxy;
mod shim;

pub use broker::{ExecuteRequest, ExecuteResponse, HostExecutor};
pub use container::{SandboxContainer, SandboxSpec, SANDBOX_BINARY_PATH, SANDBOX_LABEL};
pub use proxy::{run_tool_call_child, wrap_for_sandbox, BridgedTool};
pub use shim::{install_shims, post_execute, run_host_exec_client, ExitCodeError};

/// Environment variables recognized by the sandbox plumbing.
pub const ENV_SANDBOX_CHILD: &str = "MICLAW_SANDBOX_CHILD";
pub const ENV_EXECUTOR_SOCK: &str = "MICLAW_HOST_EXECUTOR_SOCK";
pub const ENV_EXECUTOR_TIMEOUT: &str = "MICLAW_HOST_EXECUTOR_TIMEOUT";
