// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server-originated `roots/list` sync.
//!
//! The broker can only deliver a request to the client on an HTTP response
//! that negotiated SSE, so dispatch piggybacks on the notification that
//! triggered it (`initialized` or `roots/list_changed`). One request may be
//! pending per session; replies arrive as method-less POST bodies whose id
//! matches, and the pruner times out the rest.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

use lmb_core::rpc;
use lmb_core::{PendingRoots, RootsReason, RootsSyncRecord, SessionId};

use crate::sessions::SessionManager;

/// How long the broker waits for the client's roots/list reply.
pub const ROOTS_TIMEOUT: Duration = Duration::from_secs(15);

/// Preview entries kept from a roots reply.
pub const ROOTS_PREVIEW_LIMIT: usize = 5;

/// Outcome of a trigger notification.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Send this SSE frame on the notification's response.
    Dispatched { frame: String },
    /// Client never advertised the roots capability.
    SkippedUnsupported,
    /// The notification's response cannot carry SSE.
    SkippedNoSse,
    /// A previous roots/list is still pending (single-flight).
    SkippedPending,
}

/// React to `notifications/initialized` / `notifications/roots/list_changed`.
pub fn on_trigger(
    sessions: &SessionManager,
    session_id: &SessionId,
    reason: RootsReason,
    response_accepts_sse: bool,
    now: Instant,
) -> DispatchOutcome {
    let outcome = sessions.with_session(session_id, |session| {
        if !session.caps.supports_roots {
            return DispatchOutcome::SkippedUnsupported;
        }
        if session.pending_roots.is_some() {
            return DispatchOutcome::SkippedPending;
        }
        if !response_accepts_sse {
            debug!(
                session_id = %session_id.short(),
                reason = %reason,
                "skip roots sync, no_sse"
            );
            return DispatchOutcome::SkippedNoSse;
        }

        let id = session.next_request_id();
        session.pending_roots = Some(PendingRoots { id, at: now, reason });
        let request = rpc::request(id, "roots/list", Value::Object(Default::default()));
        DispatchOutcome::Dispatched {
            frame: sse_frame(&request),
        }
    });

    outcome.unwrap_or(DispatchOutcome::SkippedUnsupported)
}

/// Route a client response (method-less POST body) to the pending request.
/// Returns false when nothing was pending or the id does not match.
pub fn on_response(
    sessions: &SessionManager,
    session_id: &SessionId,
    id: &Value,
    result: Option<&Value>,
    error: Option<&Value>,
    now_ms: u64,
) -> bool {
    sessions
        .with_session(session_id, |session| {
            let Some(pending) = session.pending_roots.as_ref() else {
                return false;
            };
            if !id_matches(id, pending.id) {
                return false;
            }
            let pending = match session.pending_roots.take() {
                Some(p) => p,
                None => return false,
            };

            let record = match (result, error) {
                (Some(result), _) => {
                    let (count, preview) = summarize_roots(result);
                    info!(
                        session_id = %session_id.short(),
                        reason = %pending.reason,
                        count,
                        "roots sync complete"
                    );
                    RootsSyncRecord {
                        at_ms: now_ms,
                        reason: pending.reason,
                        count: Some(count),
                        preview,
                        error: None,
                    }
                }
                (None, error) => RootsSyncRecord {
                    at_ms: now_ms,
                    reason: pending.reason,
                    count: None,
                    preview: Vec::new(),
                    error: Some(
                        error
                            .and_then(|e| e.get("message"))
                            .and_then(Value::as_str)
                            .unwrap_or("roots/list returned an error")
                            .to_string(),
                    ),
                },
            };
            session.last_roots_sync = Some(record);
            true
        })
        .unwrap_or(false)
}

/// Wrap a JSON-RPC value in a single SSE `message` event.
pub fn sse_frame(payload: &Value) -> String {
    format!("event: message\ndata: {payload}\n\n")
}

fn id_matches(received: &Value, pending: i64) -> bool {
    match received {
        Value::Number(n) => n.as_i64() == Some(pending),
        // Some clients echo numeric ids back as strings.
        Value::String(s) => s.parse::<i64>().ok() == Some(pending),
        _ => false,
    }
}

/// Count roots and format up to [`ROOTS_PREVIEW_LIMIT`] `name -> uri` lines.
fn summarize_roots(result: &Value) -> (usize, Vec<String>) {
    let roots = result
        .get("roots")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let preview = roots
        .iter()
        .take(ROOTS_PREVIEW_LIMIT)
        .map(|root| {
            let uri = root.get("uri").and_then(Value::as_str).unwrap_or("?");
            match root.get("name").and_then(Value::as_str) {
                Some(name) => format!("{name} -> {uri}"),
                None => uri.to_string(),
            }
        })
        .collect();

    (roots.len(), preview)
}

#[cfg(test)]
#[path = "roots_tests.rs"]
mod tests;
