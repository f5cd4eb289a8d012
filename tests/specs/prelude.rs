//! Test harness for behavioral specifications.
//!
//! Starts an in-process broker with both listeners bound to throwaway
//! endpoints, plus a stub editor-hosted backend for forwarding specs.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use lmb_broker::control::{self, ControlRequest, ControlResponse, CONTROL_TIMEOUT};
use lmb_broker::lifecycle::{self, BrokerCtx, Config};
use lmb_broker::listener::Listener;
use lmb_broker::logbuf::LogBuffer;
use lmb_broker::{http, mcp};

/// Spec polling interval/deadline for "eventually" assertions.
pub const SPEC_POLL_INTERVAL_MS: u64 = 10;
pub const SPEC_WAIT_MAX_MS: u64 = 2000;

/// One running in-process broker.
pub struct TestBroker {
    pub ctx: Arc<BrokerCtx>,
    /// Public endpoint base, e.g. `http://127.0.0.1:49301`.
    pub base: String,
    pub socket_path: PathBuf,
    _dir: TempDir,
}

/// Bind both listeners on throwaway endpoints and serve them.
pub async fn start_broker() -> TestBroker {
    start_broker_with(
        std::time::Duration::from_secs(10),
        std::time::Duration::from_secs(1),
    )
    .await
}

/// Like [`start_broker`], with explicit idle/prune timing for lifecycle
/// specs.
pub async fn start_broker_with(
    idle_grace: std::time::Duration,
    prune_interval: std::time::Duration,
) -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        pipe_name: "lm-tools-bridge-spec".to_string(),
        socket_path: dir.path().join("ctl.sock"),
        http_port: 0,
        log_file: None,
        idle_grace,
        prune_interval,
    };

    let startup = lifecycle::startup(config.clone(), LogBuffer::new(None))
        .await
        .expect("broker startup");

    let ctx = Arc::clone(&startup.ctx);
    tokio::spawn(Listener::new(startup.control_listener, Arc::clone(&ctx)).run());

    let http_ctx = Arc::clone(&ctx);
    let shutdown = Arc::clone(&ctx.shutdown);
    tokio::spawn(async move {
        let _ = http::serve(http_ctx, startup.http_listener, async move {
            shutdown.notified().await;
        })
        .await;
    });

    lifecycle::spawn_pruner(Arc::clone(&ctx));

    TestBroker {
        ctx,
        base: format!("http://127.0.0.1:{}", startup.http_port),
        socket_path: config.socket_path,
        _dir: dir,
    }
}

/// One request/response over the control socket, like the editor extension.
pub async fn control_call(socket_path: &Path, request: &ControlRequest) -> ControlResponse {
    let stream = tokio::net::UnixStream::connect(socket_path)
        .await
        .expect("connect control socket");
    let (mut reader, mut writer) = stream.into_split();

    control::send_frame(&mut writer, request).await.unwrap();
    control::recv_frame_timeout(&mut reader, CONTROL_TIMEOUT, "awaiting control response")
        .await
        .expect("control response in time")
}

/// Heartbeat an instance with one workspace folder.
pub async fn heartbeat(broker: &TestBroker, instance_id: &str, port: u16, folder: &str) {
    let response = control_call(
        &broker.socket_path,
        &ControlRequest::Heartbeat {
            instance: lmb_core::InstanceAnnouncement {
                instance_id: lmb_core::InstanceId::new(instance_id),
                pid: 4242,
                host: "127.0.0.1".to_string(),
                port,
                workspace_folders: vec![folder.to_string()],
                workspace_file: None,
            },
        },
    )
    .await;
    assert_eq!(response, ControlResponse::Ok);
}

/// Stub editor-hosted server: healthy, one tool, echoes tools/call.
pub fn spawn_tool_backend() -> (u16, JoinHandle<()>) {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Method, Request, Response, Server, StatusCode};

    async fn handle(req: Request<Body>) -> Result<Response<Body>, std::convert::Infallible> {
        let reply = |status: StatusCode, value: Value| {
            let mut response = Response::new(Body::from(value.to_string()));
            *response.status_mut() = status;
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            Ok(response)
        };

        match (req.method().clone(), req.uri().path()) {
            (Method::GET, "/mcp/health") => reply(StatusCode::OK, json!({ "ok": true })),
            (Method::POST, "/mcp") => {
                let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
                let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                let id = body.get("id").cloned().unwrap_or(Value::Null);
                let method = body.get("method").and_then(Value::as_str).unwrap_or("");

                let result = match method {
                    "tools/list" => json!({
                        "tools": [{ "name": "echoTool", "description": "echoes its arguments" }],
                    }),
                    "resources/read" => json!({
                        "contents": [{
                            "uri": body["params"]["uri"],
                            "mimeType": "application/json",
                            "text": "{\"type\":\"object\"}",
                        }],
                    }),
                    "tools/call" => json!({
                        "content": [{
                            "type": "text",
                            "text": format!("echo:{}", body["params"]["arguments"]),
                        }],
                        "isError": false,
                    }),
                    _ => json!({}),
                };
                reply(
                    StatusCode::OK,
                    json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                )
            }
            _ => reply(StatusCode::NOT_FOUND, json!({ "ok": false })),
        }
    }

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind backend");
    listener.set_nonblocking(true).expect("nonblocking");
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let make_service = make_service_fn(|_| async {
            Ok::<_, std::convert::Infallible>(service_fn(handle))
        });
        let _ = Server::from_tcp(listener).expect("backend server").serve(make_service).await;
    });

    (port, handle)
}

/// POST a JSON-RPC message to the broker's public endpoint.
pub async fn rpc(
    client: &reqwest::Client,
    base: &str,
    session: Option<&str>,
    body: Value,
) -> reqwest::Response {
    let mut request = client
        .post(format!("{base}/mcp"))
        .header("content-type", "application/json")
        .body(body.to_string());
    if let Some(session) = session {
        request = request.header(mcp::MCP_SESSION_HEADER, session);
    }
    request.send().await.expect("broker reachable")
}

/// Initialize an MCP session; returns its id.
pub async fn initialize(client: &reqwest::Client, base: &str, capabilities: Value) -> String {
    let response = rpc(
        client,
        base,
        None,
        json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": { "capabilities": capabilities },
        }),
    )
    .await;
    response
        .headers()
        .get(mcp::MCP_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .expect("session header")
        .to_string()
}

/// The workspace handshake request body.
pub fn handshake_body(cwd: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": {
            "name": "lmToolsBridge.requestWorkspaceMCPServer",
            "arguments": { "cwd": cwd },
        },
    })
}

/// Poll until `check` passes or the spec deadline elapses.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline =
        std::time::Instant::now() + std::time::Duration::from_millis(SPEC_WAIT_MAX_MS);
    while std::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(SPEC_POLL_INTERVAL_MS)).await;
    }
    panic!("condition not met within {SPEC_WAIT_MAX_MS}ms");
}
