// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker status snapshot (JSON) and the self-contained HTML dashboard.

use serde_json::{json, Value};

use crate::control::BROKER_VERSION;
use crate::roots::ROOTS_TIMEOUT;

use lmb_core::{InstanceSnapshot, SessionSummary};

use crate::registry::ReservationSnapshot;

/// Inputs for one status snapshot, gathered under the subsystem locks.
pub struct StatusInputs {
    pub now_ms: u64,
    pub uptime_secs: u64,
    pub instances: Vec<InstanceSnapshot>,
    pub reservations: Vec<ReservationSnapshot>,
    pub sessions: Vec<SessionSummary>,
}

/// Structured snapshot for `GET /mcp/status`.
pub fn status_json(inputs: &StatusInputs) -> Value {
    json!({
        "version": BROKER_VERSION,
        "pid": std::process::id(),
        "now_ms": inputs.now_ms,
        "uptime_secs": inputs.uptime_secs,
        "roots_policy": {
            "request_on": ["initialized", "list_changed"],
            "requires_sse": true,
            "timeout_ms": ROOTS_TIMEOUT.as_millis() as u64,
        },
        "instances": inputs.instances,
        "reservations": inputs.reservations,
        "sessions": inputs.sessions,
    })
}

/// Self-contained HTML rendering of the same snapshot; no external assets.
pub fn status_html(inputs: &StatusInputs) -> String {
    let mut instances_rows = String::new();
    for inst in &inputs.instances {
        instances_rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{} ms</td></tr>",
            escape(inst.instance_id.as_str()),
            inst.pid,
            inst.port,
            escape(&inst.workspace_folders.join(", ")),
            inst.last_seen_age_ms,
        ));
    }
    if instances_rows.is_empty() {
        instances_rows.push_str("<tr><td colspan=\"5\"><em>none</em></td></tr>");
    }

    let mut session_rows = String::new();
    for sess in &inputs.sessions {
        let target = sess
            .target_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = if sess.workspace_matched {
            "matched"
        } else if sess.offline {
            "offline"
        } else if sess.workspace_set_explicitly {
            "unmatched"
        } else {
            "new"
        };
        session_rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{} ms</td></tr>",
            escape(&sess.session_id.short().to_string()),
            state,
            escape(sess.resolve_cwd.as_deref().unwrap_or("-")),
            target,
            sess.idle_ms,
        ));
    }
    if session_rows.is_empty() {
        session_rows.push_str("<tr><td colspan=\"5\"><em>none</em></td></tr>");
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>lm-tools-bridge manager</title>
<style>
body {{ font-family: system-ui, sans-serif; margin: 2rem; color: #222; }}
table {{ border-collapse: collapse; margin-bottom: 1.5rem; }}
th, td {{ border: 1px solid #ccc; padding: 0.3rem 0.6rem; text-align: left; }}
th {{ background: #f4f4f4; }}
h1 {{ font-size: 1.3rem; }}
h2 {{ font-size: 1.05rem; margin-top: 1.5rem; }}
.meta {{ color: #666; }}
</style>
</head>
<body>
<h1>lm-tools-bridge manager</h1>
<p class="meta">version {version} &middot; pid {pid} &middot; up {uptime}s</p>
<h2>Instances ({instance_count})</h2>
<table>
<tr><th>instance</th><th>pid</th><th>port</th><th>folders</th><th>last seen</th></tr>
{instances_rows}
</table>
<h2>Sessions ({session_count})</h2>
<table>
<tr><th>session</th><th>state</th><th>cwd</th><th>target port</th><th>idle</th></tr>
{session_rows}
</table>
</body>
</html>
"#,
        version = BROKER_VERSION,
        pid = std::process::id(),
        uptime = inputs.uptime_secs,
        instance_count = inputs.instances.len(),
        session_count = inputs.sessions.len(),
        instances_rows = instances_rows,
        session_rows = session_rows,
    )
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
#[path = "status_page_tests.rs"]
mod tests;
