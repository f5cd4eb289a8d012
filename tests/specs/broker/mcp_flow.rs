//! End-to-end MCP specs over the public HTTP endpoint.

use crate::prelude::*;

use serde_json::{json, Value};

#[tokio::test]
async fn health_and_status_endpoints() {
    let broker = start_broker().await;
    let client = reqwest::Client::new();

    let value: Value = client
        .get(format!("{}/mcp/health", broker.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(value, json!({ "ok": true }));

    heartbeat(&broker, "inst-a", 50001, "/work/alpha").await;
    let value: Value = client
        .get(format!("{}/mcp/status", broker.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(value["instances"][0]["instance_id"], json!("inst-a"));
    assert!(value["version"].as_str().is_some());
}

/// The happy path end to end: heartbeat, initialize, handshake into a
/// subdirectory, then a merged tools/list and a bridged call.
#[tokio::test]
async fn full_session_flow() {
    let (backend_port, _backend) = spawn_tool_backend();
    let broker = start_broker().await;
    let client = reqwest::Client::new();

    heartbeat(&broker, "inst-a", backend_port, "/work/alpha").await;

    let session = initialize(&client, &broker.base, json!({})).await;

    // Handshake binds to the only instance.
    let response = rpc(
        &client,
        &broker.base,
        Some(&session),
        handshake_body("/work/alpha/sub"),
    )
    .await;
    let value: Value = response.json().await.unwrap();
    let payload = &value["result"]["structuredContent"];
    assert_eq!(payload["matched"], json!(true));
    assert_eq!(payload["port"], json!(backend_port));
    assert_eq!(
        payload["discovery"]["bridgedTools"][0]["name"],
        json!("echoTool")
    );
    assert_eq!(
        payload["discovery"]["bridgedTools"][0]["inputSchema"]["type"],
        json!("object")
    );

    // tools/list now merges synthetic + backend, no duplicates.
    let response = rpc(
        &client,
        &broker.base,
        Some(&session),
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    let value: Value = response.json().await.unwrap();
    let names: Vec<String> = value["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        names,
        vec![
            "lmToolsBridge.requestWorkspaceMCPServer".to_string(),
            "lmToolsBridge.callTool".to_string(),
            "echoTool".to_string(),
        ]
    );
    let unique: std::collections::HashSet<_> = names.iter().collect();
    assert_eq!(unique.len(), names.len(), "no duplicates by name");

    // A bridged call flows through to the backend verbatim.
    let response = rpc(
        &client,
        &broker.base,
        Some(&session),
        json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": { "name": "echoTool", "arguments": { "q": "Widget" } },
        }),
    )
    .await;
    let value: Value = response.json().await.unwrap();
    assert_eq!(value["id"], json!(3));
    assert!(value["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .starts_with("echo:"));
}

#[tokio::test]
async fn gating_before_handshake() {
    let broker = start_broker().await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &broker.base, json!({})).await;

    let response = rpc(
        &client,
        &broker.base,
        Some(&session),
        json!({ "jsonrpc": "2.0", "id": 1, "method": "prompts/list" }),
    )
    .await;
    let value: Value = response.json().await.unwrap();
    assert_eq!(value["error"]["code"], json!(-32005));
}

/// The bound instance dies, the next call reports MCP_OFFLINE, and a
/// later handshake re-binds cleanly.
#[tokio::test]
async fn offline_then_recovery() {
    let (backend_port, backend) = spawn_tool_backend();
    let broker = start_broker().await;
    let client = reqwest::Client::new();

    heartbeat(&broker, "inst-a", backend_port, "/work/alpha").await;
    let session = initialize(&client, &broker.base, json!({})).await;
    rpc(
        &client,
        &broker.base,
        Some(&session),
        handshake_body("/work/alpha"),
    )
    .await;

    // Kill the backend; the target is now unreachable.
    backend.abort();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = rpc(
        &client,
        &broker.base,
        Some(&session),
        json!({ "jsonrpc": "2.0", "id": 5, "method": "tools/call",
                "params": { "name": "echoTool", "arguments": {} } }),
    )
    .await;
    let value: Value = response.json().await.unwrap();
    assert_eq!(value["error"]["code"], json!(-32006));

    // The editor restarts its server and heartbeats again.
    let (new_port, _backend2) = spawn_tool_backend();
    heartbeat(&broker, "inst-a", new_port, "/work/alpha").await;

    let response = rpc(
        &client,
        &broker.base,
        Some(&session),
        handshake_body("/work/alpha"),
    )
    .await;
    let value: Value = response.json().await.unwrap();
    assert_eq!(
        value["result"]["structuredContent"]["port"],
        json!(new_port)
    );

    // offlineSince cleared: status shows the session as matched again.
    let status: Value = client
        .get(format!("{}/mcp/status", broker.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["sessions"][0]["workspace_matched"], json!(true));
    assert_eq!(status["sessions"][0]["offline"], json!(false));
}

/// roots/list round trip over SSE.
#[tokio::test]
async fn roots_sync_round_trip() {
    let broker = start_broker().await;
    let client = reqwest::Client::new();

    let session = initialize(
        &client,
        &broker.base,
        json!({ "roots": { "listChanged": true } }),
    )
    .await;

    // initialized notification with an SSE-capable accept header.
    let response = client
        .post(format!("{}/mcp", broker.base))
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream")
        .header(lmb_broker::mcp::MCP_SESSION_HEADER, &session)
        .body(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }).to_string())
        .send()
        .await
        .unwrap();

    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .starts_with("text/event-stream"));
    let frame = response.text().await.unwrap();
    let request: Value = serde_json::from_str(
        frame
            .trim_start_matches("event: message\ndata: ")
            .trim_end(),
    )
    .unwrap();
    assert_eq!(request["method"], json!("roots/list"));

    // Reply with one root; the broker records count and preview.
    let response = rpc(
        &client,
        &broker.base,
        Some(&session),
        json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": { "roots": [{ "uri": "file:///C:/work/alpha", "name": "alpha" }] },
        }),
    )
    .await;
    assert_eq!(response.status(), 202);

    let status: Value = client
        .get(format!("{}/mcp/status", broker.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sync = &status["sessions"][0]["last_roots_sync"];
    assert_eq!(sync["count"], json!(1));
    assert_eq!(sync["preview"][0], json!("alpha -> file:///C:/work/alpha"));
    assert_eq!(status["sessions"][0]["roots_pending"], json!(false));
}

#[tokio::test]
async fn delete_session_then_requests_fail() {
    let broker = start_broker().await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &broker.base, json!({})).await;

    let response = client
        .delete(format!("{}/mcp", broker.base))
        .header(lmb_broker::mcp::MCP_SESSION_HEADER, &session)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = rpc(
        &client,
        &broker.base,
        Some(&session),
        json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
    )
    .await;
    assert_eq!(response.status(), 404);
}
