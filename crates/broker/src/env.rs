// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the broker crate.

use std::path::PathBuf;
use std::time::Duration;

fn duration_ms(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Resolve window override for the handshake's registry retry loop.
pub fn resolve_window() -> Option<Duration> {
    duration_ms("LMB_RESOLVE_WINDOW_MS")
}

/// Pruner tick interval override.
pub fn prune_interval() -> Option<Duration> {
    duration_ms("LMB_PRUNE_INTERVAL_MS")
}

/// Idle grace override before an empty broker shuts itself down.
pub fn idle_grace() -> Option<Duration> {
    duration_ms("LMB_IDLE_GRACE_MS")
}

/// Log file the broker appends each log line to, when set.
pub fn log_file() -> Option<PathBuf> {
    std::env::var("LM_TOOLS_BRIDGE_MANAGER_LOG")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Directory for the control socket: XDG_RUNTIME_DIR > /tmp.
pub fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// OS username for the per-user socket name.
pub fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "default".to_string())
}
