// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use miclaw::runtime;
use miclaw_sandbox::ExitCodeError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Sandbox child mode: run one tool call, print its JSON result.
    if let Some(encoded) = &cli.tool_call {
        let workspace = std::env::current_dir().unwrap_or_else(|_| ".".into());
        let code = miclaw_sandbox::run_tool_call_child(encoded, workspace).await;
        std::process::exit(code);
    }

    // Broker client mode: forward a shim invocation to the host executor.
    if !cli.host_exec_client.is_empty() {
        let command = &cli.host_exec_client[0];
        let args = &cli.host_exec_client[1..];
        match miclaw_sandbox::run_host_exec_client(command, args).await {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                if let Some(ExitCodeError(code)) = e.downcast_ref::<ExitCodeError>() {
                    std::process::exit(*code);
                }
                eprintln!("host-exec: {e:#}");
                std::process::exit(1);
            }
        }
    }

    if cli.setup {
        run_setup();
        return Ok(());
    }

    let config = miclaw_config::load(cli.config.as_deref())?;
    runtime::run(config).await
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// The setup wizard lives outside the core; point the user at the config
/// file it would have written.
fn run_setup() {
    let path = miclaw_config::default_config_path();
    println!("miclaw setup");
    println!();
    println!("Write your configuration to {}", path.display());
    println!("Minimal example:");
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "provider": {
                "backend": "openrouter",
                "api_key": "sk-or-...",
                "model": "anthropic/claude-sonnet-4"
            },
            "workspace": "~/miclaw",
            "webhook": {
                "enabled": true,
                "listen": "127.0.0.1:8710",
                "hooks": [{"id": "inbox", "path": "/inbox", "format": "text"}]
            }
        }))
        .unwrap_or_default()
    );
}
