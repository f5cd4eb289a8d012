// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-RPC forwarding between the external client and the bound backend.
//!
//! Bodies pass through byte-for-byte in both directions so SSE framing is
//! never reinterpreted. On transport failure the current target is
//! health-checked; a dead target tears the binding down (`MCP_OFFLINE`),
//! a live one triggers a single re-resolve + retry against a *different*
//! target, after which the error is `MANAGER_UNREACHABLE`.

use std::time::Duration;

use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Body, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use lmb_core::rpc::{error_codes, RpcFailure};
use lmb_core::{Clock, SessionId, TargetSnapshot};

use crate::registry::Registry;
use crate::sessions::SessionManager;

/// Health checks answer fast or not at all.
pub const HEALTH_TIMEOUT: Duration = Duration::from_millis(1200);

/// Bound on non-streaming backend RPCs (discovery, list merging).
pub const BACKEND_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect budget for forwarded calls; the response body itself may stream
/// for as long as the client stays connected.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Accept header used toward backends when the client's own value is not
/// preserved verbatim.
const DEFAULT_ACCEPT: &str = "application/json, text/event-stream";

/// HTTP client wrapper for all backend traffic.
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> Self {
        // Loopback only: no TLS, small connect budget, unbounded read so
        // SSE responses stream indefinitely.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// GET the target's `/mcp/health`, bounded by [`HEALTH_TIMEOUT`].
    pub async fn health_check(&self, target: &TargetSnapshot) -> bool {
        match self
            .client
            .get(target.health_url())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(url = %target.health_url(), error = %err, "health check failed");
                false
            }
        }
    }

    /// POST a JSON-RPC body and parse the JSON response. Transport and
    /// malformed-payload failures are distinguished so callers can apply
    /// the retry policy only to the former.
    pub async fn call_rpc(
        &self,
        target: &TargetSnapshot,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let resp = self
            .client
            .post(target.url())
            .timeout(timeout)
            .header(hyper::header::ACCEPT.as_str(), "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .map_err(|e| CallError::Protocol(format!("invalid JSON from backend: {e}")))?;
        if !status.is_success() {
            return Err(CallError::Protocol(format!(
                "backend returned HTTP {status}"
            )));
        }
        Ok(value)
    }

    /// Forward a raw JSON-RPC body to the session's target, streaming the
    /// response back verbatim (headers, status, and SSE frames preserved).
    pub async fn forward(
        &self,
        sessions: &SessionManager,
        registry: &Registry,
        clock: &dyn Clock,
        session_id: &SessionId,
        body: Bytes,
        client_accept: Option<&str>,
    ) -> Result<Response<Body>, RpcFailure> {
        let target = current_target(sessions, session_id)?;
        let accept = preserved_accept(client_accept);

        match self.send_raw(&target, body.clone(), accept).await {
            Ok(resp) => Ok(stream_response(resp)),
            Err(err) => {
                warn!(url = %target.url(), error = %err, "forward transport failure");
                let retry_target = self
                    .recover_target(sessions, registry, clock, session_id, &target)
                    .await?;
                match self.send_raw(&retry_target, body, accept).await {
                    Ok(resp) => Ok(stream_response(resp)),
                    Err(retry_err) => {
                        warn!(
                            url = %retry_target.url(),
                            error = %retry_err,
                            "retry after re-resolve failed"
                        );
                        Err(RpcFailure::new(
                            error_codes::MANAGER_UNREACHABLE,
                            "no reachable editor instance for this session",
                        ))
                    }
                }
            }
        }
    }

    /// Non-streaming variant of [`Forwarder::forward`] with the same retry
    /// policy, used where the broker must read the backend's answer (list
    /// merging, the direct-call snapshot in discovery).
    pub async fn call_with_failover(
        &self,
        sessions: &SessionManager,
        registry: &Registry,
        clock: &dyn Clock,
        session_id: &SessionId,
        body: &Value,
    ) -> Result<Value, RpcFailure> {
        let target = current_target(sessions, session_id)?;

        match self.call_rpc(&target, body, BACKEND_RPC_TIMEOUT).await {
            Ok(value) => Ok(value),
            Err(CallError::Protocol(msg)) => Err(RpcFailure::internal(msg)),
            Err(CallError::Transport(err)) => {
                warn!(url = %target.url(), error = %err, "backend call transport failure");
                let retry_target = self
                    .recover_target(sessions, registry, clock, session_id, &target)
                    .await?;
                match self.call_rpc(&retry_target, body, BACKEND_RPC_TIMEOUT).await {
                    Ok(value) => Ok(value),
                    Err(CallError::Protocol(msg)) => Err(RpcFailure::internal(msg)),
                    Err(CallError::Transport(_)) => Err(RpcFailure::new(
                        error_codes::MANAGER_UNREACHABLE,
                        "no reachable editor instance for this session",
                    )),
                }
            }
        }
    }

    async fn send_raw(
        &self,
        target: &TargetSnapshot,
        body: Bytes,
        accept: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(target.url())
            .header(hyper::header::CONTENT_TYPE.as_str(), "application/json")
            .header(hyper::header::ACCEPT.as_str(), accept)
            .body(body)
            .send()
            .await
    }

    /// The retry policy's middle step: health-check the failed target, then
    /// re-resolve. Only a *different* instance is worth a retry.
    async fn recover_target(
        &self,
        sessions: &SessionManager,
        registry: &Registry,
        clock: &dyn Clock,
        session_id: &SessionId,
        failed: &TargetSnapshot,
    ) -> Result<TargetSnapshot, RpcFailure> {
        if !self.health_check(failed).await {
            sessions.mark_offline(session_id, clock.now());
            return Err(RpcFailure::new(
                error_codes::MCP_OFFLINE,
                format!("editor instance {} is offline", failed.instance_id),
            ));
        }

        let cwd = sessions
            .with_session(session_id, |s| s.resolve_cwd.clone())
            .flatten()
            .ok_or_else(|| {
                RpcFailure::new(error_codes::MANAGER_UNREACHABLE, "session has no workspace")
            })?;

        match registry.match_cwd(&cwd, clock.now()) {
            Some(record)
                if record.instance_id != failed.instance_id || record.port != failed.port =>
            {
                let target = TargetSnapshot::of(&record);
                sessions.with_session(session_id, |s| s.commit_target(target.clone()));
                debug!(
                    session_id = %session_id.short(),
                    instance_id = %target.instance_id,
                    "re-resolved to a new target"
                );
                Ok(target)
            }
            _ => Err(RpcFailure::new(
                error_codes::MANAGER_UNREACHABLE,
                "no alternative editor instance available",
            )),
        }
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport vs. protocol failure for a backend RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// Could not reach the backend; eligible for re-resolve + retry.
    Transport(String),
    /// The backend answered, but not with usable JSON-RPC.
    Protocol(String),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Transport(msg) => write!(f, "transport: {msg}"),
            CallError::Protocol(msg) => write!(f, "protocol: {msg}"),
        }
    }
}

fn current_target(
    sessions: &SessionManager,
    session_id: &SessionId,
) -> Result<TargetSnapshot, RpcFailure> {
    sessions
        .with_session(session_id, |s| s.current_target.clone())
        .flatten()
        .ok_or_else(|| {
            RpcFailure::new(
                error_codes::MANAGER_UNREACHABLE,
                "session has no bound editor instance",
            )
        })
}

/// The client's Accept header is forwarded verbatim only when it asks for
/// both JSON and SSE; otherwise the broker substitutes a value that lets
/// the backend choose either.
fn preserved_accept(client_accept: Option<&str>) -> &str {
    match client_accept {
        Some(value)
            if value.contains("application/json") && value.contains("text/event-stream") =>
        {
            value
        }
        _ => DEFAULT_ACCEPT,
    }
}

/// Re-emit a backend response without touching the body bytes.
fn stream_response(resp: reqwest::Response) -> Response<Body> {
    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in resp.headers() {
            let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) else {
                continue;
            };
            let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) else {
                continue;
            };
            headers.append(name, value);
        }
    }

    builder
        .body(Body::wrap_stream(resp.bytes_stream()))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::BAD_GATEWAY;
            fallback
        })
}

#[cfg(test)]
#[path = "forward_tests.rs"]
mod tests;
