// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session manager: issues MCP session ids, tracks per-session state, and
//! runs the workspace handshake.
//!
//! Every non-bootstrap request is gated on `workspace_matched`; the
//! handshake is the only way to flip it. Sessions expire on inactivity and
//! are pruned on the broker tick alongside timed-out roots requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use lmb_core::rpc::{error_codes, RpcFailure};
use lmb_core::{
    fresh_id, normalize_path, Clock, ClientCapabilities, RootsSyncRecord, Session, SessionId,
    SessionSummary, TargetSnapshot,
};

use crate::forward::Forwarder;
use crate::registry::Registry;
use crate::roots::ROOTS_TIMEOUT;

/// Sessions expire after this much inactivity.
pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60 * 60);

/// How long the handshake keeps retrying the registry before giving up.
/// Covers the race where the broker restarted and heartbeats are still
/// trickling back in.
pub const RESOLVE_WINDOW: Duration = Duration::from_secs(5);

/// Delay between registry retries inside the resolve window.
pub const RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// How a handshake request without a live session was bound to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeBinding {
    /// Unknown id re-created after a broker restart (recovery path).
    Recovered,
    /// No usable id supplied, or the supplied one was already taken;
    /// a fresh id was issued.
    Fresh,
}

struct SessionEntry {
    session: Session,
    /// Held across the handshake's resolve window so a session never has
    /// more than one resolve in flight.
    resolve_gate: Arc<tokio::sync::Mutex<()>>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            session,
            resolve_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Session table plus the handshake state machine.
pub struct SessionManager {
    inner: Mutex<HashMap<SessionId, SessionEntry>>,
    resolve_window: Duration,
    resolve_retry_delay: Duration,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_resolve_window(
            crate::env::resolve_window().unwrap_or(RESOLVE_WINDOW),
            RESOLVE_RETRY_DELAY,
        )
    }

    /// Custom resolve timing (tests shrink the window to keep failing
    /// handshakes fast).
    pub fn with_resolve_window(window: Duration, retry_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            resolve_window: window,
            resolve_retry_delay: retry_delay,
        }
    }

    /// Create a session for an `initialize` request.
    pub fn create(&self, caps: ClientCapabilities, now: Instant) -> SessionId {
        let id = SessionId::new(fresh_id());
        let mut session = Session::new(id.clone(), now);
        session.caps = caps;
        self.inner.lock().insert(id.clone(), SessionEntry::new(session));
        info!(session_id = %id.short(), "session created");
        id
    }

    /// Bind a handshake request whose id was not a live session.
    ///
    /// An unknown id re-creates the session under the supplied value
    /// (post-restart recovery). If the slot is occupied by the time we get
    /// here it belongs to a different session, and a fresh id is issued
    /// instead of hijacking it. No id at all issues a fresh one.
    pub fn bind_for_handshake(
        &self,
        supplied: Option<&str>,
        now: Instant,
    ) -> (SessionId, HandshakeBinding) {
        let mut inner = self.inner.lock();

        if let Some(raw) = supplied {
            let id = SessionId::new(raw);
            match inner.entry(id.clone()) {
                std::collections::hash_map::Entry::Occupied(_) => {
                    warn!(
                        session_id = %id.short(),
                        "handshake id collides with a live session; issuing a fresh one"
                    );
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(SessionEntry::new(Session::new(id.clone(), now)));
                    info!(session_id = %id.short(), "session recovered from client id");
                    return (id, HandshakeBinding::Recovered);
                }
            }
        }

        let id = SessionId::new(fresh_id());
        inner.insert(id.clone(), SessionEntry::new(Session::new(id.clone(), now)));
        (id, HandshakeBinding::Fresh)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// Refresh the inactivity clock. Returns false for unknown sessions.
    pub fn touch(&self, id: &SessionId, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(id) {
            Some(entry) => {
                entry.session.touch(now);
                true
            }
            None => false,
        }
    }

    /// Run a closure against a session's mutable state.
    pub fn with_session<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.get_mut(id).map(|entry| f(&mut entry.session))
    }

    /// Cloned view of a session's state.
    pub fn snapshot(&self, id: &SessionId) -> Option<Session> {
        self.inner.lock().get(id).map(|e| e.session.clone())
    }

    /// Delete a session (DELETE /mcp or shutdown).
    pub fn remove(&self, id: &SessionId) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn summaries(&self, now: Instant) -> Vec<SessionSummary> {
        let inner = self.inner.lock();
        let mut out: Vec<SessionSummary> =
            inner.values().map(|e| e.session.summary(now)).collect();
        out.sort_by(|a, b| a.session_id.as_str().cmp(b.session_id.as_str()));
        out
    }

    /// The target lost its health check: drop the binding, stamp
    /// `offline_since` (first failure wins).
    pub fn mark_offline(&self, id: &SessionId, now: Instant) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(id) {
            entry.session.clear_target();
            entry.session.offline_since.get_or_insert(now);
        }
    }

    /// Drop expired sessions and time out pending roots requests.
    pub fn prune(&self, now: Instant, now_ms: u64) -> Vec<SessionId> {
        let mut inner = self.inner.lock();

        for entry in inner.values_mut() {
            let session = &mut entry.session;
            let timed_out = session
                .pending_roots
                .as_ref()
                .is_some_and(|p| now.saturating_duration_since(p.at) > ROOTS_TIMEOUT);
            if timed_out {
                if let Some(pending) = session.pending_roots.take() {
                    warn!(
                        session_id = %session.session_id.short(),
                        reason = %pending.reason,
                        "roots/list response timeout"
                    );
                    session.last_roots_sync = Some(RootsSyncRecord {
                        at_ms: now_ms,
                        reason: pending.reason,
                        count: None,
                        preview: Vec::new(),
                        error: Some("roots/list response timeout".to_string()),
                    });
                }
            }
        }

        let expired: Vec<SessionId> = inner
            .iter()
            .filter(|(_, e)| e.session.is_expired(now, SESSION_TTL))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
            info!(session_id = %id.short(), "session expired");
        }
        expired
    }

    fn resolve_gate(&self, id: &SessionId) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.inner.lock().get(id).map(|e| Arc::clone(&e.resolve_gate))
    }

    /// The workspace handshake (`lmToolsBridge.requestWorkspaceMCPServer`).
    ///
    /// Resolves `cwd` against the registry inside a bounded retry window,
    /// verifies containment, health-checks the winner, and commits it as the
    /// session's target. Returns the committed snapshot; discovery runs on
    /// top of it at the call site.
    pub async fn handshake(
        &self,
        registry: &Registry,
        forwarder: &Forwarder,
        clock: &dyn Clock,
        id: &SessionId,
        cwd_raw: &str,
    ) -> Result<TargetSnapshot, RpcFailure> {
        let cwd = normalize_path(cwd_raw);
        if !is_absolute_path(&cwd) {
            return Err(RpcFailure::invalid_params(format!(
                "cwd must be an absolute path, got {cwd_raw:?}"
            )));
        }

        // Step 1: record the attempt and drop any stale binding before any
        // await point, so gating stays correct while we resolve.
        let known = self.with_session(id, |session| {
            session.resolve_cwd = Some(cwd.clone());
            session.workspace_set_explicitly = true;
            session.clear_target();
        });
        if known.is_none() {
            return Err(RpcFailure::new(
                error_codes::INVALID_REQUEST,
                "unknown session",
            ));
        }

        let gate = self
            .resolve_gate(id)
            .ok_or_else(|| RpcFailure::new(error_codes::INVALID_REQUEST, "unknown session"))?;
        let _resolving = gate.lock().await;

        // Step 2: bounded retry to cover broker-start races.
        let deadline = clock.now() + self.resolve_window;
        let record = loop {
            if let Some(record) = registry.match_cwd(&cwd, clock.now()) {
                break record;
            }
            if clock.now() >= deadline {
                let code = if registry.live_count(clock.now()) == 0 {
                    error_codes::MANAGER_UNREACHABLE
                } else {
                    error_codes::NO_MATCH
                };
                debug!(session_id = %id.short(), cwd = %cwd, "handshake found no target");
                return Err(RpcFailure::new(
                    code,
                    format!("no editor instance matches {cwd_raw}"),
                ));
            }
            tokio::time::sleep(self.resolve_retry_delay).await;
        };

        // Step 4 (spec numbering): containment re-check guards against a
        // positive score that still leaves cwd outside the instance.
        if !record.contains(&cwd) {
            return Err(RpcFailure::new(
                error_codes::NO_MATCH,
                format!("{cwd_raw} is outside the matched workspace"),
            ));
        }

        let target = TargetSnapshot::of(&record);

        // Step 5: the target must be reachable before we commit.
        if !forwarder.health_check(&target).await {
            self.mark_offline(id, clock.now());
            return Err(RpcFailure::new(
                error_codes::MCP_OFFLINE,
                format!("editor instance {} failed its health check", record.instance_id),
            ));
        }

        // Step 6: commit.
        self.with_session(id, |session| session.commit_target(target.clone()))
            .ok_or_else(|| RpcFailure::new(error_codes::INVALID_REQUEST, "unknown session"))?;
        info!(
            session_id = %id.short(),
            instance_id = %target.instance_id,
            port = target.port,
            "handshake matched"
        );

        Ok(target)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The gating error for a non-matched session: before any handshake
/// attempt it is `WORKSPACE_NOT_SET`, afterwards `NO_MATCH`.
pub fn gate_error(session: &Session) -> RpcFailure {
    if !session.workspace_set_explicitly {
        RpcFailure::new(
            error_codes::WORKSPACE_NOT_SET,
            "no workspace set; call lmToolsBridge.requestWorkspaceMCPServer first",
        )
    } else {
        RpcFailure::new(
            error_codes::NO_MATCH,
            "workspace did not match an editor instance",
        )
    }
}

/// Absolute means a Unix root or a drive-letter path (after normalization
/// separators are already forward slashes).
fn is_absolute_path(norm: &str) -> bool {
    if norm.starts_with('/') {
        return true;
    }
    let bytes = norm.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes[2] == b'/'
}

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;
