// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use std::collections::HashMap;

use crate::test_support::{spawn_backend, test_ctx, BackendBehavior};
use lmb_core::test_support::announcement;

async fn body_json(response: Response<Body>) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn header<'r>(response: &'r Response<Body>, name: &str) -> Option<&'r str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn send(
    ctx: &BrokerCtx,
    session: Option<&str>,
    accept: Option<&str>,
    body: Value,
) -> Response<Body> {
    dispatch(ctx, session, accept, Bytes::from(body.to_string())).await
}

/// initialize and return the issued session id.
async fn initialize(ctx: &BrokerCtx, capabilities: Value) -> String {
    let response = send(
        ctx,
        None,
        None,
        json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": { "capabilities": capabilities },
        }),
    )
    .await;
    header(&response, MCP_SESSION_HEADER).unwrap().to_string()
}

fn handshake_body(cwd: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": {
            "name": HANDSHAKE_TOOL,
            "arguments": { "cwd": cwd },
        },
    })
}

#[tokio::test]
async fn initialize_creates_session_and_reports_server_info() {
    let ctx = test_ctx();
    let response = send(
        &ctx,
        None,
        None,
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": { "roots": { "listChanged": true } },
            },
        }),
    )
    .await;

    let sid = header(&response, MCP_SESSION_HEADER).unwrap().to_string();
    assert!(ctx.sessions.contains(&SessionId::new(sid.as_str())));

    let value = body_json(response).await;
    assert_eq!(value["id"], json!(7));
    assert_eq!(value["result"]["protocolVersion"], json!("2025-03-26"));

    let session = ctx.sessions.snapshot(&SessionId::new(sid.as_str())).unwrap();
    assert!(session.caps.supports_roots);
    assert!(session.caps.supports_roots_list_changed);
}

#[tokio::test]
async fn request_without_session_is_rejected() {
    let ctx = test_ctx();
    let response = send(
        &ctx,
        None,
        None,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn ping_works_without_handshake() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }),
    )
    .await;
    let value = body_json(response).await;
    assert_eq!(value["result"], json!({}));
}

#[tokio::test]
async fn unmatched_session_lists_only_synthetic_tools() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }),
    )
    .await;
    let value = body_json(response).await;

    let names: Vec<&str> = value["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec![HANDSHAKE_TOOL, CALL_TOOL]);
}

#[tokio::test]
async fn unmatched_session_is_gated_with_workspace_not_set() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({ "jsonrpc": "2.0", "id": 4, "method": "prompts/list" }),
    )
    .await;
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], json!(-32005));
}

#[tokio::test]
async fn failed_handshake_flips_gate_to_no_match() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;

    // No instances: handshake fails, but the workspace is now "set".
    let response = send(&ctx, Some(&sid), None, handshake_body("/work/alpha")).await;
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], json!(-32003));

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({ "jsonrpc": "2.0", "id": 5, "method": "prompts/list" }),
    )
    .await;
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], json!(-32004));
}

#[tokio::test]
async fn bootstrap_resources_are_readable_before_handshake() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;

    for uri in [HANDSHAKE_RESOURCE_URI, CALL_TOOL_RESOURCE_URI] {
        let response = send(
            &ctx,
            Some(&sid),
            None,
            json!({
                "jsonrpc": "2.0",
                "id": 6,
                "method": "resources/read",
                "params": { "uri": uri },
            }),
        )
        .await;
        let value = body_json(response).await;
        assert_eq!(value["result"]["contents"][0]["uri"], json!(uri));
        assert!(value["result"]["contents"][0]["text"]
            .as_str()
            .unwrap()
            .contains("lm-tools-bridge"));
    }
}

#[tokio::test]
async fn non_bootstrap_resource_read_is_gated() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({
            "jsonrpc": "2.0",
            "id": 6,
            "method": "resources/read",
            "params": { "uri": "lm-tools://tool/something" },
        }),
    )
    .await;
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], json!(-32005));
}

/// Heartbeat, initialize, handshake into a subfolder, then tools/list
/// returns synthetic + backend tools.
#[tokio::test]
async fn handshake_then_merged_tools_list() {
    let backend = spawn_backend(BackendBehavior {
        tools: vec![json!({ "name": "searchSymbols", "description": "find symbols" })],
        schemas: HashMap::from([(
            "searchSymbols".to_string(),
            r#"{"type":"object"}"#.to_string(),
        )]),
        ..Default::default()
    });

    let ctx = test_ctx();
    ctx.registry.upsert(
        announcement("inst-a", backend.port, "/work/alpha"),
        ctx.clock.now(),
        0,
    );
    let sid = initialize(&ctx, json!({})).await;

    let response = send(&ctx, Some(&sid), None, handshake_body("/work/alpha/sub")).await;
    let value = body_json(response).await;
    let payload = &value["result"]["structuredContent"];
    assert_eq!(payload["matched"], json!(true));
    assert_eq!(payload["port"], json!(backend.port));
    assert_eq!(payload["instanceId"], json!("inst-a"));
    assert_eq!(
        payload["discovery"]["bridgedTools"][0]["name"],
        json!("searchSymbols")
    );
    assert_eq!(payload["discovery"]["partial"], json!(false));

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({ "jsonrpc": "2.0", "id": 8, "method": "tools/list" }),
    )
    .await;
    let value = body_json(response).await;
    let names: Vec<&str> = value["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec![HANDSHAKE_TOOL, CALL_TOOL, "searchSymbols"]);
}

#[tokio::test]
async fn merged_lists_deduplicate_with_broker_precedence() {
    // Backend claims a tool with the handshake tool's name plus a resource
    // that clashes with a bootstrap URI.
    let backend = spawn_backend(BackendBehavior {
        tools: vec![
            json!({ "name": HANDSHAKE_TOOL, "description": "impostor" }),
            json!({ "name": "genuine" }),
        ],
        resources: vec![
            json!({ "uri": HANDSHAKE_RESOURCE_URI, "name": "impostor" }),
            json!({ "uri": "lm-tools://real", "name": "real" }),
        ],
        ..Default::default()
    });

    let ctx = test_ctx();
    ctx.registry.upsert(
        announcement("inst-a", backend.port, "/work/alpha"),
        ctx.clock.now(),
        0,
    );
    let sid = initialize(&ctx, json!({})).await;
    send(&ctx, Some(&sid), None, handshake_body("/work/alpha")).await;

    let value = body_json(
        send(
            &ctx,
            Some(&sid),
            None,
            json!({ "jsonrpc": "2.0", "id": 9, "method": "tools/list" }),
        )
        .await,
    )
    .await;
    let tools = value["result"]["tools"].as_array().unwrap();
    let handshake_entries: Vec<_> = tools
        .iter()
        .filter(|t| t["name"] == json!(HANDSHAKE_TOOL))
        .collect();
    assert_eq!(handshake_entries.len(), 1, "no duplicates by name");
    assert_ne!(
        handshake_entries[0]["description"],
        json!("impostor"),
        "broker definition wins"
    );

    let value = body_json(
        send(
            &ctx,
            Some(&sid),
            None,
            json!({ "jsonrpc": "2.0", "id": 10, "method": "resources/list" }),
        )
        .await,
    )
    .await;
    let resources = value["result"]["resources"].as_array().unwrap();
    let bootstrap: Vec<_> = resources
        .iter()
        .filter(|r| r["uri"] == json!(HANDSHAKE_RESOURCE_URI))
        .collect();
    assert_eq!(bootstrap.len(), 1);
    assert!(resources.iter().any(|r| r["uri"] == json!("lm-tools://real")));
}

#[tokio::test]
async fn direct_call_forwards_tools_call() {
    let backend = spawn_backend(BackendBehavior::default());
    let ctx = test_ctx();
    ctx.registry.upsert(
        announcement("inst-a", backend.port, "/work/alpha"),
        ctx.clock.now(),
        0,
    );
    let sid = initialize(&ctx, json!({})).await;
    send(&ctx, Some(&sid), None, handshake_body("/work/alpha")).await;

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({
            "jsonrpc": "2.0",
            "id": 11,
            "method": "tools/call",
            "params": {
                "name": CALL_TOOL,
                "arguments": { "name": "searchSymbols", "arguments": { "q": "W" } },
            },
        }),
    )
    .await;
    let value = body_json(response).await;
    assert_eq!(
        value["result"]["content"][0]["text"],
        json!("called searchSymbols")
    );

    // The backend saw a real tools/call for the inner tool.
    let seen = backend.requests.lock();
    let forwarded = seen
        .iter()
        .find(|r| r["method"] == json!("tools/call"))
        .cloned()
        .unwrap();
    assert_eq!(forwarded["params"]["name"], json!("searchSymbols"));
    assert_eq!(forwarded["params"]["arguments"]["q"], json!("W"));
    assert_eq!(forwarded["id"], json!(11), "outer id rides through");
}

#[tokio::test]
async fn direct_call_rejects_synthetic_recursion() {
    let backend = spawn_backend(BackendBehavior::default());
    let ctx = test_ctx();
    ctx.registry.upsert(
        announcement("inst-a", backend.port, "/work/alpha"),
        ctx.clock.now(),
        0,
    );
    let sid = initialize(&ctx, json!({})).await;
    send(&ctx, Some(&sid), None, handshake_body("/work/alpha")).await;

    for inner in [HANDSHAKE_TOOL, CALL_TOOL] {
        let response = send(
            &ctx,
            Some(&sid),
            None,
            json!({
                "jsonrpc": "2.0",
                "id": 12,
                "method": "tools/call",
                "params": {
                    "name": CALL_TOOL,
                    "arguments": { "name": inner },
                },
            }),
        )
        .await;
        let value = body_json(response).await;
        assert_eq!(value["error"]["code"], json!(-32602));
    }
}

#[tokio::test]
async fn direct_call_requires_handshake() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({
            "jsonrpc": "2.0",
            "id": 13,
            "method": "tools/call",
            "params": { "name": CALL_TOOL, "arguments": { "name": "x" } },
        }),
    )
    .await;
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], json!(-32005));
}

/// Recovery path: a handshake with an unknown session id binds a new
/// session under that id.
#[tokio::test]
async fn handshake_recovers_unknown_session_id() {
    let backend = spawn_backend(BackendBehavior::default());
    let ctx = test_ctx();
    ctx.registry.upsert(
        announcement("inst-a", backend.port, "/work/alpha"),
        ctx.clock.now(),
        0,
    );

    let response = send(
        &ctx,
        Some("carried-over-id"),
        None,
        handshake_body("/work/alpha"),
    )
    .await;

    assert_eq!(header(&response, MCP_SESSION_HEADER), Some("carried-over-id"));
    let value = body_json(response).await;
    assert_eq!(value["result"]["structuredContent"]["matched"], json!(true));
    assert!(ctx.sessions.contains(&SessionId::new("carried-over-id")));
}

#[tokio::test]
async fn handshake_without_any_session_id_gets_fresh_one() {
    let backend = spawn_backend(BackendBehavior::default());
    let ctx = test_ctx();
    ctx.registry.upsert(
        announcement("inst-a", backend.port, "/work/alpha"),
        ctx.clock.now(),
        0,
    );

    let response = send(&ctx, None, None, handshake_body("/work/alpha")).await;
    let sid = header(&response, MCP_SESSION_HEADER).unwrap();
    assert!(ctx.sessions.contains(&SessionId::new(sid)));
}

#[tokio::test]
async fn handshake_missing_cwd_is_invalid_params() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({
            "jsonrpc": "2.0",
            "id": 14,
            "method": "tools/call",
            "params": { "name": HANDSHAKE_TOOL, "arguments": {} },
        }),
    )
    .await;
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], json!(-32602));
}

/// A handshake cwd that is a sibling-prefix of a workspace folder must
/// fail NO_MATCH (no substring leaks).
#[tokio::test]
async fn sibling_prefix_cwd_never_matches() {
    let backend = spawn_backend(BackendBehavior::default());
    let ctx = test_ctx();
    ctx.registry.upsert(
        announcement("inst-a", backend.port, "/work/alpha"),
        ctx.clock.now(),
        0,
    );
    let sid = initialize(&ctx, json!({})).await;

    let response = send(
        &ctx,
        Some(&sid),
        None,
        handshake_body("/work/alpha-sibling"),
    )
    .await;
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], json!(-32004));
}

/// An initialized notification with SSE accept triggers a roots/list
/// request; the client's POSTed reply clears the pending state.
#[tokio::test]
async fn roots_round_trip_over_sse() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({ "roots": { "listChanged": true } })).await;

    let response = send(
        &ctx,
        Some(&sid),
        Some("text/event-stream"),
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
    )
    .await;

    assert_eq!(
        header(&response, "content-type"),
        Some("text/event-stream")
    );
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let frame = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(frame.contains("roots/list"));
    let request: Value = serde_json::from_str(
        frame
            .trim_start_matches("event: message\ndata: ")
            .trim_end(),
    )
    .unwrap();
    let request_id = request["id"].clone();

    // Client replies via plain POST with the matching id.
    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "result": { "roots": [{ "uri": "file:///C:/work/alpha", "name": "alpha" }] },
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let session = ctx.sessions.snapshot(&SessionId::new(sid.as_str())).unwrap();
    assert!(session.pending_roots.is_none());
    let sync = session.last_roots_sync.unwrap();
    assert_eq!(sync.count, Some(1));
    assert_eq!(sync.preview, vec!["alpha -> file:///C:/work/alpha"]);
}

#[tokio::test]
async fn initialized_without_sse_accept_is_just_accepted() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({ "roots": {} })).await;

    let response = send(
        &ctx,
        Some(&sid),
        Some("application/json"),
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let session = ctx.sessions.snapshot(&SessionId::new(sid.as_str())).unwrap();
    assert!(session.pending_roots.is_none(), "skip, no_sse");
}

#[tokio::test]
async fn matched_session_forwards_unknown_methods() {
    let backend = spawn_backend(BackendBehavior::default());
    let ctx = test_ctx();
    ctx.registry.upsert(
        announcement("inst-a", backend.port, "/work/alpha"),
        ctx.clock.now(),
        0,
    );
    let sid = initialize(&ctx, json!({})).await;
    send(&ctx, Some(&sid), None, handshake_body("/work/alpha")).await;

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({ "jsonrpc": "2.0", "id": 15, "method": "prompts/list", "params": {} }),
    )
    .await;
    let value = body_json(response).await;
    // The stub backend answers everything with an empty result.
    assert_eq!(value["id"], json!(15));
    assert!(value.get("result").is_some());

    let seen = backend.requests.lock();
    assert!(seen.iter().any(|r| r["method"] == json!("prompts/list")));
}

/// Bind a session straight to a dead target (nothing listens on port 1).
fn bind_dead_target(ctx: &BrokerCtx, sid: &str) {
    let record = lmb_core::InstanceRecord::from_announcement(
        announcement("inst-dead", 1, "/work/alpha"),
        ctx.clock.now(),
        0,
    );
    ctx.sessions.with_session(&SessionId::new(sid), |s| {
        s.resolve_cwd = Some("/work/alpha".to_string());
        s.workspace_set_explicitly = true;
        s.commit_target(lmb_core::TargetSnapshot::of(&record));
    });
}

/// A matched session whose backend is unreachable still gets the broker's
/// own resource templates, flagged partial, instead of an error.
#[tokio::test]
async fn merged_templates_degrade_when_backend_unreachable() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;
    bind_dead_target(&ctx, &sid);

    let response = send(
        &ctx,
        Some(&sid),
        None,
        json!({ "jsonrpc": "2.0", "id": 20, "method": "resources/templates/list" }),
    )
    .await;
    let value = body_json(response).await;

    assert!(value.get("error").is_none(), "listing must not fail outright");
    let templates = value["result"]["resourceTemplates"].as_array().unwrap();
    assert_eq!(templates.len(), 2, "broker templates always appear");
    assert_eq!(
        templates[0]["uriTemplate"],
        json!("lm-tools://tool/{name}")
    );
    assert_eq!(
        templates[1]["uriTemplate"],
        json!("lm-tools://schema/{name}")
    );
    assert_eq!(value["result"]["partial"], json!(true));
}

#[tokio::test]
async fn merged_tools_degrade_when_backend_unreachable() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;
    bind_dead_target(&ctx, &sid);

    let value = body_json(
        send(
            &ctx,
            Some(&sid),
            None,
            json!({ "jsonrpc": "2.0", "id": 21, "method": "tools/list" }),
        )
        .await,
    )
    .await;

    let names: Vec<&str> = value["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec![HANDSHAKE_TOOL, CALL_TOOL]);
    assert_eq!(value["result"]["partial"], json!(true));
}

#[tokio::test]
async fn merged_resources_degrade_when_backend_unreachable() {
    let ctx = test_ctx();
    let sid = initialize(&ctx, json!({})).await;
    bind_dead_target(&ctx, &sid);

    let value = body_json(
        send(
            &ctx,
            Some(&sid),
            None,
            json!({ "jsonrpc": "2.0", "id": 22, "method": "resources/list" }),
        )
        .await,
    )
    .await;

    let uris: Vec<&str> = value["result"]["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["uri"].as_str().unwrap())
        .collect();
    assert_eq!(uris, vec![HANDSHAKE_RESOURCE_URI, CALL_TOOL_RESOURCE_URI]);
    assert_eq!(value["result"]["partial"], json!(true));
}

#[tokio::test]
async fn successful_merge_carries_no_partial_marker() {
    let backend = spawn_backend(BackendBehavior::default());
    let ctx = test_ctx();
    ctx.registry.upsert(
        announcement("inst-a", backend.port, "/work/alpha"),
        ctx.clock.now(),
        0,
    );
    let sid = initialize(&ctx, json!({})).await;
    send(&ctx, Some(&sid), None, handshake_body("/work/alpha")).await;

    let value = body_json(
        send(
            &ctx,
            Some(&sid),
            None,
            json!({ "jsonrpc": "2.0", "id": 23, "method": "resources/templates/list" }),
        )
        .await,
    )
    .await;
    assert!(value["result"].get("partial").is_none());
}

#[tokio::test]
async fn batch_requests_are_rejected() {
    let ctx = test_ctx();
    let response = send(
        &ctx,
        None,
        None,
        json!([{ "jsonrpc": "2.0", "id": 1, "method": "ping" }]),
    )
    .await;
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], json!(-32600));
}
