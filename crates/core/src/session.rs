// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client MCP session state.
//!
//! A session is created by `initialize` (or recovered on handshake), bound
//! to an editor instance by the workspace handshake, and expires on
//! inactivity. The broker never persists sessions.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instance::{InstanceId, InstanceRecord};

crate::string_id! {
    /// Unique identifier for one MCP client connection, issued by the broker
    /// in the `Mcp-Session-Id` header.
    pub struct SessionId;
}

/// Why a `roots/list` request was dispatched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RootsReason {
    Initialized,
    ListChanged,
}

impl std::fmt::Display for RootsReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootsReason::Initialized => write!(f, "initialized"),
            RootsReason::ListChanged => write!(f, "list_changed"),
        }
    }
}

/// Client capability record parsed from `initialize.params.capabilities`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientCapabilities {
    pub supports_roots: bool,
    pub supports_roots_list_changed: bool,
    /// The capability object exactly as the client sent it.
    pub raw: Value,
    /// Top-level capability name → whether it was present as an object.
    pub flags: BTreeMap<String, bool>,
    /// Top-level capability name → its subkeys, for object-valued entries.
    pub subkeys: BTreeMap<String, Vec<String>>,
}

impl ClientCapabilities {
    /// Parse the `capabilities` value of an `initialize` request. Absent or
    /// non-object input yields the empty record.
    pub fn parse(capabilities: Option<&Value>) -> Self {
        let mut flags = BTreeMap::new();
        let mut subkeys = BTreeMap::new();

        if let Some(obj) = capabilities.and_then(Value::as_object) {
            for (name, value) in obj {
                flags.insert(name.clone(), value.is_object());
                if let Some(sub) = value.as_object() {
                    subkeys.insert(name.clone(), sub.keys().cloned().collect());
                }
            }
        }

        let supports_roots = flags.get("roots").copied().unwrap_or(false);
        let supports_roots_list_changed = capabilities
            .and_then(|c| c.get("roots"))
            .and_then(|r| r.get("listChanged"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self {
            supports_roots,
            supports_roots_list_changed,
            raw: capabilities.cloned().unwrap_or(Value::Null),
            flags,
            subkeys,
        }
    }
}

/// Immutable snapshot of the instance a session is bound to.
///
/// Taken at handshake commit; the registry record may change or die
/// afterwards, which the forwarder discovers on the next call.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSnapshot {
    pub instance_id: InstanceId,
    pub host: String,
    pub port: u16,
    pub workspace_folders: Vec<String>,
    pub workspace_file: Option<String>,
    pub norm_folders: Vec<String>,
    pub norm_file: Option<String>,
}

impl TargetSnapshot {
    pub fn of(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            host: record.host.clone(),
            port: record.port,
            workspace_folders: record.workspace_folders.clone(),
            workspace_file: record.workspace_file.clone(),
            norm_folders: record.norm_folders.clone(),
            norm_file: record.norm_file.clone(),
        }
    }

    /// Base URL of the backend's MCP endpoint.
    pub fn url(&self) -> String {
        format!("http://{}:{}/mcp", self.host, self.port)
    }

    /// URL of the backend's health endpoint.
    pub fn health_url(&self) -> String {
        format!("http://{}:{}/mcp/health", self.host, self.port)
    }
}

/// An outstanding broker-initiated `roots/list` request.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRoots {
    pub id: i64,
    pub at: Instant,
    pub reason: RootsReason,
}

/// Outcome of the most recent roots sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootsSyncRecord {
    pub at_ms: u64,
    pub reason: RootsReason,
    #[serde(default)]
    pub count: Option<usize>,
    /// At most five `name -> uri` strings.
    #[serde(default)]
    pub preview: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One MCP client session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub created_at: Instant,
    /// Refreshed on every authenticated request; drives the session TTL.
    pub last_seen: Instant,
    /// Normalized cwd from the most recent handshake attempt.
    pub resolve_cwd: Option<String>,
    pub workspace_set_explicitly: bool,
    pub workspace_matched: bool,
    pub current_target: Option<TargetSnapshot>,
    /// Set when the last known target became unreachable.
    pub offline_since: Option<Instant>,
    pub caps: ClientCapabilities,
    pub pending_roots: Option<PendingRoots>,
    pub last_roots_sync: Option<RootsSyncRecord>,
    /// Counter for broker-initiated request ids on this session.
    pub next_server_request_id: i64,
}

impl Session {
    pub fn new(session_id: SessionId, now: Instant) -> Self {
        Self {
            session_id,
            created_at: now,
            last_seen: now,
            resolve_cwd: None,
            workspace_set_explicitly: false,
            workspace_matched: false,
            current_target: None,
            offline_since: None,
            caps: ClientCapabilities::default(),
            pending_roots: None,
            last_roots_sync: None,
            next_server_request_id: 1,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > ttl
    }

    /// Drop any binding; invariant: `current_target` is unset whenever
    /// `workspace_matched` is false.
    pub fn clear_target(&mut self) {
        self.workspace_matched = false;
        self.current_target = None;
    }

    /// Bind to a freshly health-checked instance.
    pub fn commit_target(&mut self, target: TargetSnapshot) {
        self.current_target = Some(target);
        self.workspace_matched = true;
        self.offline_since = None;
    }

    /// Allocate the next id for a broker-initiated request.
    pub fn next_request_id(&mut self) -> i64 {
        let id = self.next_server_request_id;
        self.next_server_request_id += 1;
        id
    }

    /// Serializable view for the status endpoint.
    pub fn summary(&self, now: Instant) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            workspace_set_explicitly: self.workspace_set_explicitly,
            workspace_matched: self.workspace_matched,
            resolve_cwd: self.resolve_cwd.clone(),
            target_instance_id: self
                .current_target
                .as_ref()
                .map(|t| t.instance_id.clone()),
            target_port: self.current_target.as_ref().map(|t| t.port),
            offline: self.offline_since.is_some(),
            supports_roots: self.caps.supports_roots,
            roots_pending: self.pending_roots.is_some(),
            last_roots_sync: self.last_roots_sync.clone(),
            idle_ms: now.saturating_duration_since(self.last_seen).as_millis() as u64,
        }
    }
}

/// Wire/status view of a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub workspace_set_explicitly: bool,
    pub workspace_matched: bool,
    #[serde(default)]
    pub resolve_cwd: Option<String>,
    #[serde(default)]
    pub target_instance_id: Option<InstanceId>,
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub supports_roots: bool,
    #[serde(default)]
    pub roots_pending: bool,
    #[serde(default)]
    pub last_roots_sync: Option<RootsSyncRecord>,
    #[serde(default)]
    pub idle_ms: u64,
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
