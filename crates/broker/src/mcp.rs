// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-RPC dispatch for `POST /mcp`.
//!
//! Bootstrap traffic (initialize, ping, the synthetic tools, the bootstrap
//! resources) is answered locally; everything else requires a matched
//! session and is forwarded verbatim. Client responses (method-less bodies)
//! route to the roots correlator instead of the backend.

use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use lmb_core::rpc::{self, error_codes, RpcFailure, RpcMessage};
use lmb_core::{ClientCapabilities, RootsReason, SessionId};

use crate::discovery::{
    self, bootstrap_resources, resource_templates, synthetic_tools, CALL_TOOL,
    CALL_TOOL_RESOURCE_URI, HANDSHAKE_RESOURCE_URI, HANDSHAKE_TOOL,
};
use crate::lifecycle::BrokerCtx;
use crate::roots::{self, DispatchOutcome};
use crate::sessions::{gate_error, HandshakeBinding};
use crate::status_page;

/// Session id header on requests and responses.
pub const MCP_SESSION_HEADER: &str = "mcp-session-id";

/// Protocol revision echoed to clients that don't request one.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Handle one `POST /mcp` body.
pub async fn dispatch(
    ctx: &BrokerCtx,
    session_header: Option<&str>,
    accept: Option<&str>,
    body: Bytes,
) -> Response<Body> {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            return json_response(
                StatusCode::OK,
                &rpc::response_error(
                    &Value::Null,
                    error_codes::PARSE_ERROR,
                    &format!("invalid JSON: {err}"),
                ),
                None,
            );
        }
    };

    let message = match RpcMessage::parse(&value) {
        Ok(m) => m,
        Err(err) => {
            return json_response(
                StatusCode::OK,
                &rpc::response_error(&Value::Null, err.code(), &err.to_string()),
                None,
            );
        }
    };

    let accepts_sse = accept.is_some_and(|a| a.contains("text/event-stream"));

    match message {
        RpcMessage::Response { id, result, error } => {
            handle_client_response(ctx, session_header, &id, result, error)
        }
        RpcMessage::Notification { method, params } => {
            handle_notification(ctx, session_header, &method, params, accepts_sse).await
        }
        RpcMessage::Request { id, method, params } => {
            handle_request(ctx, session_header, accept, &id, &method, params, body).await
        }
    }
}

/// A response body from the client correlates to a broker-initiated request.
fn handle_client_response(
    ctx: &BrokerCtx,
    session_header: Option<&str>,
    id: &Value,
    result: Option<Value>,
    error: Option<Value>,
) -> Response<Body> {
    let Some(session_id) = known_session(ctx, session_header) else {
        debug!("client response without a known session, dropping");
        return accepted_response(None);
    };
    ctx.sessions.touch(&session_id, ctx.clock.now());

    let matched = roots::on_response(
        &ctx.sessions,
        &session_id,
        id,
        result.as_ref(),
        error.as_ref(),
        ctx.clock.epoch_ms(),
    );
    if !matched {
        debug!(
            session_id = %session_id.short(),
            "client response did not match a pending request"
        );
    }
    accepted_response(Some(&session_id))
}

async fn handle_notification(
    ctx: &BrokerCtx,
    session_header: Option<&str>,
    method: &str,
    params: Option<Value>,
    accepts_sse: bool,
) -> Response<Body> {
    let Some(session_id) = known_session(ctx, session_header) else {
        return accepted_response(None);
    };
    let now = ctx.clock.now();
    ctx.sessions.touch(&session_id, now);

    let reason = match method {
        "notifications/initialized" => Some(RootsReason::Initialized),
        "notifications/roots/list_changed" => Some(RootsReason::ListChanged),
        _ => None,
    };

    if let Some(reason) = reason {
        return match roots::on_trigger(&ctx.sessions, &session_id, reason, accepts_sse, now) {
            DispatchOutcome::Dispatched { frame } => sse_response(frame, Some(&session_id)),
            DispatchOutcome::SkippedUnsupported
            | DispatchOutcome::SkippedNoSse
            | DispatchOutcome::SkippedPending => accepted_response(Some(&session_id)),
        };
    }

    // Other notifications flow through to a matched backend; for unbound
    // sessions they are acknowledged and dropped.
    let matched = ctx
        .sessions
        .with_session(&session_id, |s| s.workspace_matched)
        .unwrap_or(false);
    if matched {
        let body = match serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => return accepted_response(Some(&session_id)),
        };
        if let Err(err) = ctx
            .forwarder
            .forward(
                &ctx.sessions,
                &ctx.registry,
                ctx.clock.as_ref(),
                &session_id,
                body,
                None,
            )
            .await
        {
            warn!(
                session_id = %session_id.short(),
                method,
                error = %err,
                "notification forward failed"
            );
        }
    }
    accepted_response(Some(&session_id))
}

async fn handle_request(
    ctx: &BrokerCtx,
    session_header: Option<&str>,
    accept: Option<&str>,
    id: &Value,
    method: &str,
    params: Option<Value>,
    raw_body: Bytes,
) -> Response<Body> {
    // initialize creates the session; everything else needs one.
    if method == "initialize" {
        return handle_initialize(ctx, id, params.as_ref());
    }

    let now = ctx.clock.now();
    let session_id = match known_session(ctx, session_header) {
        Some(id) => {
            ctx.sessions.touch(&id, now);
            id
        }
        None if is_handshake_call(method, params.as_ref()) => {
            // Recovery path: a handshake may re-create a session after a
            // broker restart, under the client's id when it is free.
            let (id, binding) = ctx.sessions.bind_for_handshake(session_header, now);
            debug!(session_id = %id.short(), ?binding, "handshake bound session");
            id
        }
        None => {
            return json_response(
                StatusCode::NOT_FOUND,
                &rpc::response_error(
                    id,
                    error_codes::INVALID_REQUEST,
                    "unknown or missing Mcp-Session-Id",
                ),
                None,
            );
        }
    };

    if method == "ping" {
        return json_response(
            StatusCode::OK,
            &rpc::response_ok(id, json!({})),
            Some(&session_id),
        );
    }

    let matched = ctx
        .sessions
        .with_session(&session_id, |s| s.workspace_matched)
        .unwrap_or(false);

    let result = match method {
        "tools/call" => handle_tools_call(ctx, &session_id, id, params.as_ref(), matched).await,
        "tools/list" => merged_tools(ctx, &session_id, matched).await,
        "resources/list" => merged_resources(ctx, &session_id, matched).await,
        "resources/templates/list" => merged_templates(ctx, &session_id, matched).await,
        "resources/read" => {
            match handle_resource_read(ctx, &session_id, params.as_ref(), matched) {
                ReadOutcome::Local(result) => result,
                ReadOutcome::Forward => {
                    return forward_raw(ctx, &session_id, accept, id, raw_body).await;
                }
            }
        }
        _ if matched => return forward_raw(ctx, &session_id, accept, id, raw_body).await,
        _ => Err(ctx
            .sessions
            .with_session(&session_id, |s| gate_error(s))
            .unwrap_or_else(|| {
                RpcFailure::new(error_codes::INVALID_REQUEST, "unknown session")
            })),
    };

    match result {
        Ok(value) => json_response(
            StatusCode::OK,
            &rpc::response_ok(id, value),
            Some(&session_id),
        ),
        Err(failure) => json_response(
            StatusCode::OK,
            &failure.to_response(id),
            Some(&session_id),
        ),
    }
}

fn handle_initialize(ctx: &BrokerCtx, id: &Value, params: Option<&Value>) -> Response<Body> {
    let caps = ClientCapabilities::parse(params.and_then(|p| p.get("capabilities")));
    let session_id = ctx.sessions.create(caps, ctx.clock.now());

    let protocol_version = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or(PROTOCOL_VERSION);

    let result = json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": { "listChanged": false },
            "resources": {},
        },
        "serverInfo": {
            "name": "lm-tools-bridge-manager",
            "version": crate::control::BROKER_VERSION,
        },
        "instructions": format!(
            "Call {HANDSHAKE_TOOL} with your workspace cwd before using any bridged tool."
        ),
    });

    json_response(
        StatusCode::OK,
        &rpc::response_ok(id, result),
        Some(&session_id),
    )
}

async fn handle_tools_call(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    id: &Value,
    params: Option<&Value>,
    matched: bool,
) -> Result<Value, RpcFailure> {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| RpcFailure::invalid_params("tools/call requires params.name"))?;

    match name {
        HANDSHAKE_TOOL => handle_handshake(ctx, session_id, params).await,
        CALL_TOOL => {
            if !matched {
                return Err(ctx
                    .sessions
                    .with_session(session_id, |s| gate_error(s))
                    .unwrap_or_else(|| {
                        RpcFailure::new(error_codes::INVALID_REQUEST, "unknown session")
                    }));
            }
            let arguments = params.and_then(|p| p.get("arguments")).cloned();
            direct_call(ctx, session_id, id, arguments).await
        }
        _ if matched => {
            // Plain bridged tool: forwarded via the JSON path so the result
            // can be returned under the caller's id.
            let body = json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "tools/call",
                "params": params,
            });
            backend_result(ctx, session_id, &body).await
        }
        _ => Err(ctx
            .sessions
            .with_session(session_id, |s| gate_error(s))
            .unwrap_or_else(|| RpcFailure::new(error_codes::INVALID_REQUEST, "unknown session"))),
    }
}

async fn handle_handshake(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    params: Option<&Value>,
) -> Result<Value, RpcFailure> {
    let cwd = params
        .and_then(|p| p.get("arguments"))
        .and_then(|a| a.get("cwd"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            RpcFailure::invalid_params("requestWorkspaceMCPServer requires arguments.cwd")
        })?;

    let target = ctx
        .sessions
        .handshake(
            &ctx.registry,
            &ctx.forwarder,
            ctx.clock.as_ref(),
            session_id,
            cwd,
        )
        .await?;

    let report = discovery::discover(&ctx.forwarder, &target).await;
    let report_value = serde_json::to_value(&report)
        .map_err(|e| RpcFailure::internal(format!("discovery serialization: {e}")))?;

    let payload = json!({
        "matched": true,
        "instanceId": target.instance_id,
        "host": target.host,
        "port": target.port,
        "workspaceFolders": target.workspace_folders,
        "workspaceFile": target.workspace_file,
        "discovery": report_value,
    });

    let summary = format!(
        "Matched editor instance {} on port {} ({} bridged tools{})",
        target.instance_id,
        target.port,
        report.bridged_tools.len(),
        if report.partial { ", partial" } else { "" },
    );

    Ok(json!({
        "content": [{ "type": "text", "text": summary }],
        "structuredContent": payload,
        "isError": false,
    }))
}

/// The `lmToolsBridge.callTool` shortcut: wrap and forward a `tools/call`.
async fn direct_call(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    id: &Value,
    arguments: Option<Value>,
) -> Result<Value, RpcFailure> {
    let arguments = arguments.unwrap_or_else(|| json!({}));
    let tool = arguments
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcFailure::invalid_params("callTool requires arguments.name"))?;

    if tool == HANDSHAKE_TOOL || tool == CALL_TOOL {
        return Err(RpcFailure::invalid_params(format!(
            "refusing to call broker tool {tool} through callTool"
        )));
    }

    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {
            "name": tool,
            "arguments": arguments.get("arguments").cloned().unwrap_or_else(|| json!({})),
        },
    });
    backend_result(ctx, session_id, &body).await
}

/// Call the backend and unwrap the JSON-RPC result (errors pass through
/// with their original code where possible).
async fn backend_result(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    body: &Value,
) -> Result<Value, RpcFailure> {
    let response = ctx
        .forwarder
        .call_with_failover(
            &ctx.sessions,
            &ctx.registry,
            ctx.clock.as_ref(),
            session_id,
            body,
        )
        .await?;

    if let Some(error) = response.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(error_codes::INTERNAL_ERROR);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("backend error");
        return Err(RpcFailure::new(code, message));
    }
    response
        .get("result")
        .cloned()
        .ok_or_else(|| RpcFailure::internal("backend response had no result"))
}

async fn merged_tools(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    matched: bool,
) -> Result<Value, RpcFailure> {
    let mut tools = synthetic_tools();
    let partial =
        merge_backend_list(ctx, session_id, matched, &mut tools, "tools/list", "tools", "name")
            .await;

    Ok(list_result("tools", tools, partial))
}

async fn merged_resources(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    matched: bool,
) -> Result<Value, RpcFailure> {
    let mut resources = bootstrap_resources();
    let partial = merge_backend_list(
        ctx,
        session_id,
        matched,
        &mut resources,
        "resources/list",
        "resources",
        "uri",
    )
    .await;

    Ok(list_result("resources", resources, partial))
}

async fn merged_templates(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    matched: bool,
) -> Result<Value, RpcFailure> {
    let mut templates = resource_templates();
    let partial = merge_backend_list(
        ctx,
        session_id,
        matched,
        &mut templates,
        "resources/templates/list",
        "resourceTemplates",
        "uriTemplate",
    )
    .await;

    Ok(list_result("resourceTemplates", templates, partial))
}

/// Fetch the backend's half of a merged listing. The broker-synthetic
/// entries always appear, so a backend failure degrades the result to
/// `partial: true` instead of failing the whole request.
async fn merge_backend_list(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    matched: bool,
    base: &mut Vec<Value>,
    method: &str,
    list_key: &str,
    dedupe_key: &str,
) -> bool {
    if !matched {
        return false;
    }

    let body = json!({
        "jsonrpc": "2.0",
        "id": format!("proxy-{method}"),
        "method": method,
        "params": {},
    });
    match backend_result(ctx, session_id, &body).await {
        Ok(backend) => {
            append_unique(base, backend.get(list_key), dedupe_key);
            false
        }
        Err(err) => {
            warn!(
                session_id = %session_id.short(),
                method,
                error = %err,
                "backend listing failed; serving synthetic entries only"
            );
            true
        }
    }
}

fn list_result(list_key: &str, entries: Vec<Value>, partial: bool) -> Value {
    let mut result = serde_json::Map::new();
    result.insert(list_key.to_string(), Value::Array(entries));
    if partial {
        result.insert("partial".to_string(), Value::Bool(true));
    }
    Value::Object(result)
}

/// Append backend entries, de-duplicated by `key`; broker entries win.
fn append_unique(base: &mut Vec<Value>, backend: Option<&Value>, key: &str) {
    let Some(entries) = backend.and_then(Value::as_array) else {
        return;
    };
    for entry in entries {
        let Some(entry_key) = entry.get(key).and_then(Value::as_str) else {
            continue;
        };
        let duplicate = base
            .iter()
            .any(|b| b.get(key).and_then(Value::as_str) == Some(entry_key));
        if !duplicate {
            base.push(entry.clone());
        }
    }
}

enum ReadOutcome {
    Local(Result<Value, RpcFailure>),
    Forward,
}

fn handle_resource_read(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    params: Option<&Value>,
    matched: bool,
) -> ReadOutcome {
    let Some(uri) = params.and_then(|p| p.get("uri")).and_then(Value::as_str) else {
        return ReadOutcome::Local(Err(RpcFailure::invalid_params(
            "resources/read requires params.uri",
        )));
    };

    match uri {
        HANDSHAKE_RESOURCE_URI => {
            ReadOutcome::Local(Ok(handshake_resource_contents(ctx)))
        }
        CALL_TOOL_RESOURCE_URI => ReadOutcome::Local(Ok(call_tool_resource_contents())),
        _ if matched => ReadOutcome::Forward,
        _ => ReadOutcome::Local(Err(ctx
            .sessions
            .with_session(session_id, |s| gate_error(s))
            .unwrap_or_else(|| RpcFailure::new(error_codes::INVALID_REQUEST, "unknown session")))),
    }
}

fn handshake_resource_contents(ctx: &BrokerCtx) -> Value {
    let status = status_page::status_json(&ctx.status_inputs());
    let text = format!(
        "lm-tools-bridge workspace handshake\n\
         ====================================\n\
         Call the tool {HANDSHAKE_TOOL} with {{\"cwd\": \"<absolute path>\"}}\n\
         to bind this session to the editor whose workspace contains cwd.\n\
         Until then only ping, tools/list, resources/list and this resource\n\
         are served.\n\n\
         Current broker status:\n{status:#}\n",
    );
    json!({
        "contents": [{
            "uri": HANDSHAKE_RESOURCE_URI,
            "mimeType": "text/plain",
            "text": text,
        }],
    })
}

fn call_tool_resource_contents() -> Value {
    let text = format!(
        "lm-tools-bridge direct tool call\n\
         =================================\n\
         {CALL_TOOL} forwards a tools/call to the bound editor instance.\n\n\
         Example:\n\
         {{\"name\": \"{CALL_TOOL}\", \"arguments\": {{\n\
            \"name\": \"searchSymbols\",\n\
            \"arguments\": {{\"query\": \"Widget\"}}\n\
         }}}}\n\n\
         The synthetic broker tools cannot be invoked through this shortcut.\n",
    );
    json!({
        "contents": [{
            "uri": CALL_TOOL_RESOURCE_URI,
            "mimeType": "text/plain",
            "text": text,
        }],
    })
}

async fn forward_raw(
    ctx: &BrokerCtx,
    session_id: &SessionId,
    accept: Option<&str>,
    id: &Value,
    raw_body: Bytes,
) -> Response<Body> {
    match ctx
        .forwarder
        .forward(
            &ctx.sessions,
            &ctx.registry,
            ctx.clock.as_ref(),
            session_id,
            raw_body,
            accept,
        )
        .await
    {
        Ok(mut response) => {
            attach_session_header(&mut response, Some(session_id));
            response
        }
        Err(failure) => json_response(
            StatusCode::OK,
            &failure.to_response(id),
            Some(session_id),
        ),
    }
}

/// True when the request is the workspace handshake tool call — the one
/// request allowed to bind a session on its own.
fn is_handshake_call(method: &str, params: Option<&Value>) -> bool {
    method == "tools/call"
        && params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .is_some_and(|name| name == HANDSHAKE_TOOL)
}

fn known_session(ctx: &BrokerCtx, session_header: Option<&str>) -> Option<SessionId> {
    let raw = session_header?;
    let id = SessionId::new(raw);
    ctx.sessions.contains(&id).then_some(id)
}

pub(crate) fn json_response(
    status: StatusCode,
    value: &Value,
    session_id: Option<&SessionId>,
) -> Response<Body> {
    let body = value.to_string();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    attach_session_header(&mut response, session_id);
    response
}

fn sse_response(frame: String, session_id: Option<&SessionId>) -> Response<Body> {
    let mut response = Response::new(Body::from(frame));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-cache"));
    attach_session_header(&mut response, session_id);
    response
}

fn accepted_response(session_id: Option<&SessionId>) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::ACCEPTED;
    attach_session_header(&mut response, session_id);
    response
}

fn attach_session_header(response: &mut Response<Body>, session_id: Option<&SessionId>) {
    if let Some(id) = session_id {
        if let Ok(value) = HeaderValue::from_str(id.as_str()) {
            response.headers_mut().insert(MCP_SESSION_HEADER, value);
        }
    }
}

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod tests;
