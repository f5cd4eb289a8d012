// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! lm-tools-bridge manager (lmbd)
//!
//! Long-running loopback broker between external MCP clients and
//! editor-hosted tool servers.
//!
//! Architecture:
//! - Control listener task: per-user Unix socket (heartbeat, allocate, ...)
//! - HTTP listener task: public /mcp endpoint (JSON-RPC + SSE)
//! - Pruner task: TTL expiry and idle shutdown
//! - Main task: waits for shutdown (command, signal, or idle)

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use lmb_broker::control::BROKER_VERSION;
use lmb_broker::lifecycle::{self, Config, LifecycleError};
use lmb_broker::listener::Listener;
use lmb_broker::logbuf::LogBuffer;
use lmb_broker::http;

/// Parsed CLI surface.
#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    pipe: Option<String>,
    http_port: Option<u16>,
}

enum CliOutcome {
    Run(CliArgs),
    /// Printed something informational; exit 0.
    Handled,
    /// Bad usage; exit 1.
    Invalid(String),
}

fn parse_args(mut args: impl Iterator<Item = String>) -> CliOutcome {
    let mut parsed = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("lmbd {BROKER_VERSION}");
                return CliOutcome::Handled;
            }
            "--help" | "-h" | "help" => {
                println!("lmbd {BROKER_VERSION}");
                println!("lm-tools-bridge manager - loopback broker between MCP clients and editor-hosted tool servers");
                println!();
                println!("USAGE:");
                println!("    lmbd [--pipe <name>] [--http-port <n>]");
                println!();
                println!("The broker is typically started by the editor extension and");
                println!("should not need manual invocation. It exits on its own once");
                println!("no editor instance has heartbeated for a grace period.");
                println!();
                println!("OPTIONS:");
                println!("    --pipe <name>      Override the control socket name");
                println!("    --http-port <n>    Override the public MCP port (default 47100)");
                println!("    -h, --help         Print help information");
                println!("    -v, --version      Print version information");
                return CliOutcome::Handled;
            }
            "--pipe" => match args.next() {
                Some(value) if !value.is_empty() => parsed.pipe = Some(value),
                _ => return CliOutcome::Invalid("--pipe requires a name".to_string()),
            },
            "--http-port" => match args.next().map(|v| v.parse::<u16>()) {
                Some(Ok(port)) if port != 0 => parsed.http_port = Some(port),
                _ => {
                    return CliOutcome::Invalid(
                        "--http-port requires a port number in [1, 65535]".to_string(),
                    )
                }
            },
            other => {
                return CliOutcome::Invalid(format!("unexpected argument '{other}'"));
            }
        }
    }

    CliOutcome::Run(parsed)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        CliOutcome::Run(args) => args,
        CliOutcome::Handled => return ExitCode::SUCCESS,
        CliOutcome::Invalid(message) => {
            eprintln!("error: {message}");
            eprintln!("Usage: lmbd [--pipe <name>] [--http-port <n>]");
            return ExitCode::FAILURE;
        }
    };

    let config = Config::with_overrides(args.pipe, args.http_port);

    // Ring buffer + optional file append, shared with /mcp/log
    let logbuf = LogBuffer::new(config.log_file.as_deref());
    setup_logging(&logbuf);

    info!(version = BROKER_VERSION, "starting lm-tools-bridge manager");

    let startup = match lifecycle::startup(config.clone(), logbuf).await {
        Ok(startup) => startup,
        Err(LifecycleError::AlreadyRunning(path)) => {
            // Bind contention is a policy outcome, not an error: the
            // incumbent broker keeps serving and this process bows out.
            info!(socket = %path.display(), "another broker is already running; exiting");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("failed to start broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    let ctx = Arc::clone(&startup.ctx);

    // Control-plane listener
    let control = Listener::new(startup.control_listener, Arc::clone(&ctx));
    let control_handle = tokio::spawn(control.run());

    // Public HTTP listener with graceful shutdown
    let http_ctx = Arc::clone(&ctx);
    let http_shutdown = Arc::clone(&ctx.shutdown);
    let mut http_handle = tokio::spawn(async move {
        http::serve(http_ctx, startup.http_listener, async move {
            http_shutdown.notified().await;
        })
        .await
    });

    // TTL expiry + idle shutdown
    lifecycle::spawn_pruner(Arc::clone(&ctx));

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGINT handler: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        socket = %ctx.config.socket_path.display(),
        http_port = startup.http_port,
        "broker ready"
    );

    // Signal ready for the supervising editor process
    println!("READY");

    let exit = tokio::select! {
        _ = ctx.shutdown.notified() => {
            info!("shutdown requested");
            ExitCode::SUCCESS
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            ExitCode::SUCCESS
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            ExitCode::SUCCESS
        }
        result = &mut http_handle => {
            match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    error!("http listener failed: {e}");
                    ExitCode::FAILURE
                }
                Err(e) => {
                    error!("http listener task panicked: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    };

    control_handle.abort();
    http_handle.abort();
    lifecycle::cleanup(&ctx.config);
    exit
}

fn setup_logging(logbuf: &LogBuffer) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(logbuf.layer())
        .init();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
