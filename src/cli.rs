// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

/// miclaw — an always-on AI agent runtime.
#[derive(Parser, Debug)]
#[command(name = "miclaw", version, about)]
pub struct Cli {
    /// Config file path (default: ~/.miclaw/config.json).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run the interactive setup and exit.
    #[arg(long, alias = "configure")]
    pub setup: bool,

    /// Verbose logging to stderr (same as RUST_LOG=debug).
    #[arg(long, short)]
    pub verbose: bool,

    /// Internal: execute one base64-encoded tool call and print its result
    /// (sandbox child mode).
    #[arg(long, value_name = "B64", hide = true)]
    pub tool_call: Option<String>,

    /// Internal: forward a command invocation to the host-command broker
    /// (shim client mode).
    #[arg(
        long,
        value_name = "CMD [ARGS...]",
        num_args = 1..,
        allow_hyphen_values = true,
        hide = true
    )]
    pub host_exec_client: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_flag() {
        let cli = Cli::parse_from(["miclaw", "--config", "/tmp/c.json"]);
        assert_eq!(cli.config.unwrap(), PathBuf::from("/tmp/c.json"));
    }

    #[test]
    fn configure_is_an_alias_for_setup() {
        let cli = Cli::parse_from(["miclaw", "--configure"]);
        assert!(cli.setup);
    }

    #[test]
    fn host_exec_client_collects_command_and_args() {
        let cli = Cli::parse_from(["miclaw", "--host-exec-client", "git", "status", "-sb"]);
        assert_eq!(cli.host_exec_client, vec!["git", "status", "-sb"]);
    }

    #[test]
    fn tool_call_takes_encoded_payload() {
        let cli = Cli::parse_from(["miclaw", "--tool-call", "eyJ9"]);
        assert_eq!(cli.tool_call.as_deref(), Some("eyJ9"));
    }
}
