// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane listener task.
//!
//! Accepts connections on the per-user Unix socket and handles one
//! request/response pair per connection without blocking the broker.
//! The shutdown response is written (and flushed) before the shutdown
//! signal fires, honoring the reply-before-close contract.

use std::sync::Arc;

use lmb_core::paths::normalize_path;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::control::{
    self, ControlRequest, ControlResponse, WireError, BROKER_VERSION, CONTROL_TIMEOUT,
};
use crate::lifecycle::BrokerCtx;
use crate::ports::AllocateError;

/// Listener task for accepting control socket connections.
pub struct Listener {
    socket: UnixListener,
    ctx: Arc<BrokerCtx>,
}

/// Errors from connection handling.
#[derive(Debug, Error)]
enum ConnectionError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl Listener {
    pub fn new(socket: UnixListener, ctx: Arc<BrokerCtx>) -> Self {
        Self { socket, ctx }
    }

    /// Run the accept loop, spawning a task per connection.
    pub async fn run(self) {
        loop {
            match self.socket.accept().await {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &ctx).await {
                            match e {
                                ConnectionError::Wire(WireError::Closed) => {
                                    debug!("control client disconnected")
                                }
                                ConnectionError::Wire(WireError::Deadline(_)) => {
                                    warn!("control connection timeout")
                                }
                                _ => error!("control connection error: {}", e),
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("control accept error: {}", e);
                }
            }
        }
    }
}

/// Handle a single control connection: one request, one response.
async fn handle_connection(stream: UnixStream, ctx: &BrokerCtx) -> Result<(), ConnectionError> {
    let (mut reader, mut writer) = stream.into_split();

    let request: ControlRequest =
        control::recv_frame_timeout(&mut reader, CONTROL_TIMEOUT, "reading control request")
            .await?;

    // Heartbeats arrive continuously; keep them at debug
    if matches!(request, ControlRequest::Heartbeat { .. }) {
        debug!(request = ?request, "received control request");
    } else {
        info!(request = ?request, "received control request");
    }

    let (response, shutdown_after_reply) = handle_request(request, ctx);

    control::send_frame_timeout(&mut writer, &response, CONTROL_TIMEOUT, "writing control response")
        .await?;

    // The reply is on the wire; now the listeners may close.
    if shutdown_after_reply {
        ctx.shutdown.notify_one();
    }

    Ok(())
}

/// Handle one request. The bool asks the connection to fire shutdown after
/// the response is flushed.
fn handle_request(request: ControlRequest, ctx: &BrokerCtx) -> (ControlResponse, bool) {
    let now = ctx.clock.now();

    let response = match request {
        ControlRequest::Health => ControlResponse::Pong,

        ControlRequest::Status => ControlResponse::Status {
            version: BROKER_VERSION.to_string(),
            pid: std::process::id(),
            now_ms: ctx.clock.epoch_ms(),
            uptime_secs: ctx.uptime_secs(),
            instances: ctx.registry.live_count(now),
            sessions: ctx.sessions.count(),
        },

        ControlRequest::List => ControlResponse::Instances {
            instances: ctx.registry.live_snapshots(now),
            reservations: ctx.registry.reservation_snapshots(now),
        },

        ControlRequest::Heartbeat { instance } => {
            if instance.port == 0 {
                ControlResponse::Error {
                    message: "heartbeat port must be non-zero".to_string(),
                }
            } else {
                ctx.registry.upsert(instance, now, ctx.clock.epoch_ms());
                ControlResponse::Ok
            }
        }

        ControlRequest::Bye { instance_id } => {
            if ctx.registry.remove(&instance_id) {
                info!(instance_id = %instance_id, "instance departed");
            }
            ControlResponse::Ok
        }

        ControlRequest::Allocate {
            instance_id,
            preferred_port,
            min_port,
        } => match ctx.registry.allocate(&instance_id, preferred_port, min_port, now) {
            Ok(port) => ControlResponse::Allocated { port },
            Err(AllocateError::PortExhausted { .. }) => ControlResponse::PortExhausted,
            Err(err @ AllocateError::InvalidPort) => ControlResponse::Error {
                message: err.to_string(),
            },
        },

        ControlRequest::Resolve { cwd } => {
            let instance = ctx
                .registry
                .match_cwd(&normalize_path(&cwd), now)
                .map(|record| record.snapshot(now));
            ControlResponse::Resolved { instance }
        }

        ControlRequest::Shutdown {
            reason,
            expected_version,
        } => {
            if let Some(expected) = expected_version {
                if expected != BROKER_VERSION {
                    warn!(
                        expected,
                        running = BROKER_VERSION,
                        "shutdown refused: version mismatch"
                    );
                    return (
                        ControlResponse::VersionMismatch {
                            version: BROKER_VERSION.to_string(),
                        },
                        false,
                    );
                }
            }
            info!(reason = reason.as_deref().unwrap_or("unspecified"), "shutdown requested");
            return (ControlResponse::ShuttingDown, true);
        }
    };

    (response, false)
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
