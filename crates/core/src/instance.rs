// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Live editor-hosted server records and workspace matching.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::paths::{is_descendant, is_within, normalize_path};

crate::string_id! {
    /// Unique identifier for one editor-hosted tool server.
    ///
    /// Issued by the editor per window/session; opaque to the broker.
    pub struct InstanceId;
}

/// Heartbeat payload announcing (or refreshing) an editor-hosted server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceAnnouncement {
    pub instance_id: InstanceId,
    pub pid: u32,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub workspace_folders: Vec<String>,
    #[serde(default)]
    pub workspace_file: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// How well a cwd matches an instance. Higher wins; ties break on `last_seen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchScore {
    None,
    /// cwd is strictly inside one of the workspace folders.
    Descendant,
    /// cwd equals one of the workspace folders.
    Folder,
    /// cwd equals the `.code-workspace`-style workspace file.
    WorkspaceFile,
}

/// One live editor-hosted tool server, keyed by `instance_id`.
///
/// `last_seen` is monotonic and drives the registry TTL; `started_at_ms` is
/// wall-clock for display and survives heartbeat refreshes.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub workspace_folders: Vec<String>,
    pub workspace_file: Option<String>,
    /// Normalized copies of the folders, same order.
    pub norm_folders: Vec<String>,
    pub norm_file: Option<String>,
    pub started_at_ms: u64,
    pub last_seen: Instant,
}

impl InstanceRecord {
    /// Build a fresh record from a first heartbeat.
    pub fn from_announcement(ann: InstanceAnnouncement, now: Instant, now_ms: u64) -> Self {
        let norm_folders = ann.workspace_folders.iter().map(|f| normalize_path(f)).collect();
        let norm_file = ann.workspace_file.as_deref().map(normalize_path);
        Self {
            instance_id: ann.instance_id,
            pid: ann.pid,
            host: ann.host,
            port: ann.port,
            workspace_folders: ann.workspace_folders,
            workspace_file: ann.workspace_file,
            norm_folders,
            norm_file,
            started_at_ms: now_ms,
            last_seen: now,
        }
    }

    /// Refresh from a subsequent heartbeat: everything may change except
    /// `started_at_ms`, which is preserved across refreshes.
    pub fn refresh(&mut self, ann: InstanceAnnouncement, now: Instant) {
        self.norm_folders = ann.workspace_folders.iter().map(|f| normalize_path(f)).collect();
        self.norm_file = ann.workspace_file.as_deref().map(normalize_path);
        self.pid = ann.pid;
        self.host = ann.host;
        self.port = ann.port;
        self.workspace_folders = ann.workspace_folders;
        self.workspace_file = ann.workspace_file;
        self.last_seen = now;
    }

    /// An entry is live while `now - last_seen <= ttl`.
    pub fn is_live(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) <= ttl
    }

    /// Score a normalized cwd against this instance. Precedence:
    /// workspace file > exact folder > descendant > none.
    pub fn match_score(&self, cwd_norm: &str) -> MatchScore {
        if self.norm_file.as_deref() == Some(cwd_norm) {
            return MatchScore::WorkspaceFile;
        }
        if self.norm_folders.iter().any(|f| f == cwd_norm) {
            return MatchScore::Folder;
        }
        if self.norm_folders.iter().any(|f| is_descendant(cwd_norm, f)) {
            return MatchScore::Descendant;
        }
        MatchScore::None
    }

    /// Containment check used after a match commits: the cwd must lie inside
    /// one of the folders or equal the workspace file.
    pub fn contains(&self, cwd_norm: &str) -> bool {
        self.norm_file.as_deref() == Some(cwd_norm)
            || self.norm_folders.iter().any(|f| is_within(cwd_norm, f))
    }

    /// Serializable view for `/list`, `/resolve`, and the status page.
    pub fn snapshot(&self, now: Instant) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.instance_id.clone(),
            pid: self.pid,
            host: self.host.clone(),
            port: self.port,
            workspace_folders: self.workspace_folders.clone(),
            workspace_file: self.workspace_file.clone(),
            started_at_ms: self.started_at_ms,
            last_seen_age_ms: now.saturating_duration_since(self.last_seen).as_millis() as u64,
        }
    }
}

/// Wire/status view of an [`InstanceRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSnapshot {
    pub instance_id: InstanceId,
    pub pid: u32,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub workspace_folders: Vec<String>,
    #[serde(default)]
    pub workspace_file: Option<String>,
    #[serde(default)]
    pub started_at_ms: u64,
    /// How long ago the last heartbeat arrived, relative to snapshot time.
    #[serde(default)]
    pub last_seen_age_ms: u64,
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;
