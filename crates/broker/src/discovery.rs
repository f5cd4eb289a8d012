// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Discovery aggregation: after a successful handshake the broker fetches
//! the backend's tool list and per-tool schemas, and merges them with the
//! broker-synthetic tools.
//!
//! Failures degrade instead of aborting: a failed `tools/list` marks the
//! payload partial, an unreadable schema is only a warning on that tool.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use lmb_core::TargetSnapshot;

use crate::forward::{CallError, Forwarder, BACKEND_RPC_TIMEOUT};

/// The workspace handshake tool.
pub const HANDSHAKE_TOOL: &str = "lmToolsBridge.requestWorkspaceMCPServer";

/// The direct-call shortcut tool.
pub const CALL_TOOL: &str = "lmToolsBridge.callTool";

/// Bootstrap resource with handshake instructions + a status snapshot.
pub const HANDSHAKE_RESOURCE_URI: &str = "lm-tools-bridge://handshake";

/// Bootstrap resource describing the direct-call shortcut.
pub const CALL_TOOL_RESOURCE_URI: &str = "lm-tools-bridge://callTool";

/// Resource template for a backend tool description.
pub const TOOL_TEMPLATE: &str = "lm-tools://tool/{name}";

/// Resource template for a backend tool's input schema.
pub const SCHEMA_TEMPLATE: &str = "lm-tools://schema/{name}";

/// Severity of a discovery issue.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    Error,
    Warning,
}

/// Which discovery step produced an issue.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum IssueCategory {
    #[serde(rename = "tools/list")]
    ToolsList,
    #[serde(rename = "schema")]
    Schema,
}

/// One structured problem found while aggregating a backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiscoveryIssue {
    pub level: IssueLevel,
    pub category: IssueCategory,
    pub code: String,
    pub message: String,
    #[serde(rename = "toolName", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// One backend tool with its (optionally recovered) input schema.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BridgedTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// The discovery payload embedded in the handshake result.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiscoveryReport {
    #[serde(rename = "callTool")]
    pub call_tool: Value,
    #[serde(rename = "bridgedTools")]
    pub bridged_tools: Vec<BridgedTool>,
    #[serde(rename = "resourceTemplates")]
    pub resource_templates: Vec<Value>,
    pub partial: bool,
    pub issues: Vec<DiscoveryIssue>,
}

/// Tool definition for the handshake tool, advertised even when unbound.
pub fn handshake_tool_definition() -> Value {
    json!({
        "name": HANDSHAKE_TOOL,
        "description": "Bind this session to the editor whose workspace contains the given cwd. Must be called before any bridged tool.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "cwd": {
                    "type": "string",
                    "description": "Absolute path inside the target workspace",
                }
            },
            "required": ["cwd"],
        },
    })
}

/// Tool definition for the direct-call shortcut, advertised even when unbound.
pub fn call_tool_definition() -> Value {
    json!({
        "name": CALL_TOOL,
        "description": "Invoke a bridged editor tool by name without listing it first.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Bridged tool name" },
                "arguments": { "type": "object", "description": "Arguments for the tool" },
            },
            "required": ["name"],
        },
    })
}

/// The two synthetic tools, in the order they are listed.
pub fn synthetic_tools() -> Vec<Value> {
    vec![handshake_tool_definition(), call_tool_definition()]
}

/// Static resource templates the broker always serves.
pub fn resource_templates() -> Vec<Value> {
    vec![
        json!({
            "uriTemplate": TOOL_TEMPLATE,
            "name": "Bridged tool description",
            "mimeType": "application/json",
        }),
        json!({
            "uriTemplate": SCHEMA_TEMPLATE,
            "name": "Bridged tool input schema",
            "mimeType": "application/json",
        }),
    ]
}

/// Bootstrap resource descriptors for `resources/list`.
pub fn bootstrap_resources() -> Vec<Value> {
    vec![
        json!({
            "uri": HANDSHAKE_RESOURCE_URI,
            "name": "Workspace handshake",
            "mimeType": "text/plain",
        }),
        json!({
            "uri": CALL_TOOL_RESOURCE_URI,
            "name": "Direct tool call",
            "mimeType": "text/plain",
        }),
    ]
}

/// Aggregate the backend behind `target` into a [`DiscoveryReport`].
pub async fn discover(forwarder: &Forwarder, target: &TargetSnapshot) -> DiscoveryReport {
    let mut issues = Vec::new();
    let mut bridged: Vec<BridgedTool> = Vec::new();

    let list_request = json!({
        "jsonrpc": "2.0",
        "id": "discover-tools",
        "method": "tools/list",
        "params": {},
    });

    match forwarder
        .call_rpc(target, &list_request, BACKEND_RPC_TIMEOUT)
        .await
    {
        Ok(response) => match tools_from_response(&response) {
            Ok(tools) => {
                for tool in tools {
                    let Some(name) = tool.get("name").and_then(Value::as_str) else {
                        issues.push(DiscoveryIssue {
                            level: IssueLevel::Warning,
                            category: IssueCategory::ToolsList,
                            code: "unnamed_tool".to_string(),
                            message: "backend returned a tool without a name".to_string(),
                            tool_name: None,
                            details: Some(tool.clone()),
                        });
                        continue;
                    };
                    if name == HANDSHAKE_TOOL || name == CALL_TOOL {
                        continue;
                    }
                    let description = tool
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let input_schema =
                        fetch_schema(forwarder, target, name, &mut issues).await;
                    bridged.push(BridgedTool {
                        name: name.to_string(),
                        description,
                        input_schema,
                    });
                }
            }
            Err(message) => issues.push(DiscoveryIssue {
                level: IssueLevel::Error,
                category: IssueCategory::ToolsList,
                code: "tools_list_malformed".to_string(),
                message,
                tool_name: None,
                details: None,
            }),
        },
        Err(err) => {
            let code = match err {
                CallError::Transport(_) => "tools_list_unreachable",
                CallError::Protocol(_) => "tools_list_failed",
            };
            issues.push(DiscoveryIssue {
                level: IssueLevel::Error,
                category: IssueCategory::ToolsList,
                code: code.to_string(),
                message: err.to_string(),
                tool_name: None,
                details: None,
            });
        }
    }

    bridged.sort_by(|a, b| a.name.cmp(&b.name));
    let partial = issues.iter().any(|i| i.level == IssueLevel::Error);

    DiscoveryReport {
        call_tool: call_tool_definition(),
        bridged_tools: bridged,
        resource_templates: resource_templates(),
        partial,
        issues,
    }
}

/// Read `lm-tools://schema/{name}` from the backend. Any problem demotes to
/// a warning and the tool is listed without a schema.
async fn fetch_schema(
    forwarder: &Forwarder,
    target: &TargetSnapshot,
    tool_name: &str,
    issues: &mut Vec<DiscoveryIssue>,
) -> Option<Value> {
    let uri = SCHEMA_TEMPLATE.replace("{name}", tool_name);
    let request = json!({
        "jsonrpc": "2.0",
        "id": format!("discover-schema-{tool_name}"),
        "method": "resources/read",
        "params": { "uri": uri },
    });

    let warn = |issues: &mut Vec<DiscoveryIssue>, code: &str, message: String| {
        issues.push(DiscoveryIssue {
            level: IssueLevel::Warning,
            category: IssueCategory::Schema,
            code: code.to_string(),
            message,
            tool_name: Some(tool_name.to_string()),
            details: None,
        });
    };

    let response = match forwarder
        .call_rpc(target, &request, BACKEND_RPC_TIMEOUT)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn(issues, "schema_read_failed", err.to_string());
            return None;
        }
    };

    if let Some(error) = response.get("error") {
        warn(
            issues,
            "schema_read_rejected",
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("backend rejected the schema read")
                .to_string(),
        );
        return None;
    }

    let text = response
        .get("result")
        .and_then(|r| r.get("contents"))
        .and_then(Value::as_array)
        .and_then(|contents| contents.first())
        .and_then(|entry| entry.get("text"))
        .and_then(Value::as_str);

    let Some(text) = text else {
        warn(
            issues,
            "schema_empty",
            "schema resource had no text content".to_string(),
        );
        return None;
    };

    match serde_json::from_str::<Value>(text) {
        Ok(schema) if schema.is_object() => {
            debug!(tool = tool_name, "schema attached");
            Some(schema)
        }
        Ok(_) => {
            warn(
                issues,
                "schema_not_object",
                "schema did not parse to a JSON object".to_string(),
            );
            None
        }
        Err(err) => {
            warn(issues, "schema_unparseable", err.to_string());
            None
        }
    }
}

fn tools_from_response(response: &Value) -> Result<&Vec<Value>, String> {
    if let Some(error) = response.get("error") {
        return Err(error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("backend rejected tools/list")
            .to_string());
    }
    response
        .get("result")
        .and_then(|r| r.get("tools"))
        .and_then(Value::as_array)
        .ok_or_else(|| "tools/list response had no tools array".to_string())
}

#[cfg(test)]
#[path = "discovery_tests.rs"]
mod tests;
