// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker lifecycle: configuration, startup (bind both listeners),
//! the pruner tick, idle shutdown, and cleanup.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{info, warn};

use lmb_core::{Clock, SystemClock};

use crate::control::{self, BROKER_VERSION};
use crate::forward::Forwarder;
use crate::logbuf::LogBuffer;
use crate::registry::{Registry, IDLE_GRACE};
use crate::sessions::SessionManager;
use crate::status_page::StatusInputs;

/// Default public MCP port.
pub const DEFAULT_HTTP_PORT: u16 = 47100;

/// Pruner tick.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Broker configuration (CLI + environment).
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane pipe name (without directory or `.sock` suffix).
    pub pipe_name: String,
    /// Filesystem path of the control socket.
    pub socket_path: PathBuf,
    /// Public MCP port on loopback.
    pub http_port: u16,
    /// Append-target for log lines (`LM_TOOLS_BRIDGE_MANAGER_LOG`).
    pub log_file: Option<PathBuf>,
    /// How long the broker outlives its last instance/reservation.
    pub idle_grace: Duration,
    /// Pruner tick interval.
    pub prune_interval: Duration,
}

impl Config {
    /// Configuration from defaults + environment (no CLI overrides).
    pub fn load() -> Self {
        Self::with_overrides(None, None)
    }

    /// Configuration with CLI overrides applied; timing knobs come from the
    /// environment or fall back to the built-in defaults.
    pub fn with_overrides(pipe: Option<String>, http_port: Option<u16>) -> Self {
        let pipe_name = pipe.unwrap_or_else(control::default_pipe_name);
        let socket_path = control::socket_path(&pipe_name);
        Self {
            pipe_name,
            socket_path,
            http_port: http_port.unwrap_or(DEFAULT_HTTP_PORT),
            log_file: crate::env::log_file(),
            idle_grace: crate::env::idle_grace().unwrap_or(IDLE_GRACE),
            prune_interval: crate::env::prune_interval().unwrap_or(PRUNE_INTERVAL),
        }
    }
}

/// Shared state for every listener and handler task.
pub struct BrokerCtx {
    pub config: Config,
    pub registry: Registry,
    pub sessions: SessionManager,
    pub forwarder: Forwarder,
    pub clock: Arc<dyn Clock>,
    pub logbuf: LogBuffer,
    pub start_time: Instant,
    pub start_ms: u64,
    /// Signalled by /shutdown, signals, or idle detection.
    pub shutdown: Arc<Notify>,
}

impl BrokerCtx {
    pub fn new(config: Config, logbuf: LogBuffer) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();
        let start_ms = clock.epoch_ms();
        Self {
            config,
            registry: Registry::new(now),
            sessions: SessionManager::new(),
            forwarder: Forwarder::new(),
            clock,
            logbuf,
            start_time: now,
            start_ms,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.clock
            .now()
            .saturating_duration_since(self.start_time)
            .as_secs()
    }

    /// Gather the inputs for one status snapshot.
    pub fn status_inputs(&self) -> StatusInputs {
        let now = self.clock.now();
        StatusInputs {
            now_ms: self.clock.epoch_ms(),
            uptime_secs: self.uptime_secs(),
            instances: self.registry.live_snapshots(now),
            reservations: self.registry.reservation_snapshots(now),
            sessions: self.sessions.summaries(now),
        }
    }
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Another broker already owns the control socket. Not a failure:
    /// the process exits 0 and lets the incumbent serve.
    #[error("another broker is already running on {0}")]
    AlreadyRunning(PathBuf),

    #[error("failed to bind control socket at {0}: {1}")]
    BindControl(PathBuf, std::io::Error),

    #[error("failed to bind http listener on 127.0.0.1:{0}: {1}")]
    BindHttp(u16, std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listeners bound during startup.
pub struct StartupResult {
    pub ctx: Arc<BrokerCtx>,
    pub control_listener: UnixListener,
    pub http_listener: TcpListener,
    /// The actual HTTP port (differs from config when 0 was requested).
    pub http_port: u16,
}

/// Bind the control socket and the public HTTP listener.
///
/// Bind-contention on the control socket means another broker is serving
/// this user; that is a clean exit, not an error path. A stale socket file
/// (nothing accepting) is removed and rebound.
pub async fn startup(config: Config, logbuf: LogBuffer) -> Result<StartupResult, LifecycleError> {
    let control_listener = bind_control(&config.socket_path).await?;

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.http_port));
    let http_listener = TcpListener::bind(addr)
        .map_err(|e| LifecycleError::BindHttp(config.http_port, e))?;
    http_listener.set_nonblocking(true)?;
    let http_port = http_listener.local_addr()?.port();

    info!(
        socket = %config.socket_path.display(),
        http_port,
        "broker listeners bound"
    );

    let ctx = Arc::new(BrokerCtx::new(config, logbuf));
    Ok(StartupResult {
        ctx,
        control_listener,
        http_listener,
        http_port,
    })
}

async fn bind_control(socket_path: &Path) -> Result<UnixListener, LifecycleError> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            // A connectable socket means a live broker; a dead file means an
            // unclean shutdown we can recover from.
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(LifecycleError::AlreadyRunning(socket_path.to_path_buf()));
            }
            warn!(
                socket = %socket_path.display(),
                "removing stale control socket"
            );
            std::fs::remove_file(socket_path)?;
            UnixListener::bind(socket_path)
                .map_err(|e| LifecycleError::BindControl(socket_path.to_path_buf(), e))
        }
        Err(err) => Err(LifecycleError::BindControl(socket_path.to_path_buf(), err)),
    }
}

/// Remove the control socket on the way out.
pub fn cleanup(config: &Config) {
    if config.socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&config.socket_path) {
            warn!("failed to remove control socket: {e}");
        }
    }
    info!(version = BROKER_VERSION, "broker shutdown complete");
}

/// Fixed-interval pruner: expires registry entries, reservations, sessions,
/// and pending roots requests, and fires idle shutdown once the registry has
/// been empty past the grace window.
pub fn spawn_pruner(ctx: Arc<BrokerCtx>) {
    let interval = ctx.config.prune_interval;
    let grace = ctx.config.idle_grace;

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let now = ctx.clock.now();
            let now_ms = ctx.clock.epoch_ms();

            let outcome = ctx.registry.prune(now);
            for id in &outcome.expired_instances {
                info!(instance_id = %id, "instance expired (missed heartbeats)");
            }
            for id in &outcome.expired_reservations {
                info!(instance_id = %id, "port reservation expired");
            }

            ctx.sessions.prune(now, now_ms);

            if ctx.registry.idle_expired(now, grace) {
                info!(
                    grace_secs = grace.as_secs(),
                    "no instances or reservations; idle shutdown"
                );
                ctx.shutdown.notify_one();
                return;
            }
        }
    });
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
