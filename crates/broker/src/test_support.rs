// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-crate test helpers: a broker context without bound listeners and a
//! stub editor-hosted backend served over real loopback HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use lmb_core::{Clock, SystemClock};

use crate::forward::Forwarder;
use crate::lifecycle::{BrokerCtx, Config};
use crate::logbuf::LogBuffer;
use crate::registry::Registry;
use crate::sessions::SessionManager;

/// Broker context with fast resolve timing and no bound listeners.
pub fn test_ctx() -> BrokerCtx {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now();
    let start_ms = clock.epoch_ms();
    BrokerCtx {
        config: Config {
            pipe_name: "lm-tools-bridge-test".to_string(),
            socket_path: std::env::temp_dir().join("lm-tools-bridge-test.sock"),
            http_port: 0,
            log_file: None,
            idle_grace: crate::registry::IDLE_GRACE,
            prune_interval: crate::lifecycle::PRUNE_INTERVAL,
        },
        registry: Registry::new(now),
        sessions: SessionManager::with_resolve_window(
            Duration::from_millis(100),
            Duration::from_millis(20),
        ),
        forwarder: Forwarder::new(),
        clock,
        logbuf: LogBuffer::new(None),
        start_time: now,
        start_ms,
        shutdown: Arc::new(Notify::new()),
    }
}

/// Behavior knobs for the stub backend.
#[derive(Clone, Default)]
pub struct BackendBehavior {
    /// Tools returned from `tools/list`.
    pub tools: Vec<Value>,
    /// `lm-tools://schema/{name}` resource text per tool.
    pub schemas: HashMap<String, String>,
    /// Resources returned from `resources/list`.
    pub resources: Vec<Value>,
    /// Respond 500 to health checks.
    pub unhealthy: bool,
    /// Respond to every RPC with this JSON-RPC error object.
    pub rpc_error: Option<Value>,
}

/// A stub backend bound to an ephemeral loopback port.
pub struct TestBackend {
    pub port: u16,
    /// Bodies of every POST /mcp received, in order.
    pub requests: Arc<Mutex<Vec<Value>>>,
    handle: JoinHandle<()>,
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve a fake editor-hosted MCP server for the forwarder to talk to.
pub fn spawn_backend(behavior: BackendBehavior) -> TestBackend {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind backend");
    listener.set_nonblocking(true).expect("nonblocking");
    let port = listener.local_addr().expect("local addr").port();

    let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&requests);
    let behavior = Arc::new(behavior);

    let handle = tokio::spawn(async move {
        let make_service = make_service_fn(move |_| {
            let behavior = Arc::clone(&behavior);
            let captured = Arc::clone(&captured);
            async move {
                Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                    let behavior = Arc::clone(&behavior);
                    let captured = Arc::clone(&captured);
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            handle_backend(req, &behavior, &captured).await,
                        )
                    }
                }))
            }
        });
        let server = Server::from_tcp(listener).expect("backend server").serve(make_service);
        let _ = server.await;
    });

    TestBackend {
        port,
        requests,
        handle,
    }
}

async fn handle_backend(
    req: Request<Body>,
    behavior: &BackendBehavior,
    captured: &Mutex<Vec<Value>>,
) -> Response<Body> {
    match (req.method().clone(), req.uri().path()) {
        (Method::GET, "/mcp/health") => {
            if behavior.unhealthy {
                respond(StatusCode::INTERNAL_SERVER_ERROR, json!({ "ok": false }))
            } else {
                respond(StatusCode::OK, json!({ "ok": true }))
            }
        }
        (Method::POST, "/mcp") => {
            let accept = req
                .headers()
                .get(hyper::header::ACCEPT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = hyper::body::to_bytes(req.into_body())
                .await
                .unwrap_or_default();
            let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            captured.lock().push(body.clone());

            let id = body.get("id").cloned().unwrap_or(Value::Null);
            if let Some(error) = &behavior.rpc_error {
                return respond(
                    StatusCode::OK,
                    json!({ "jsonrpc": "2.0", "id": id, "error": error }),
                );
            }

            let method = body.get("method").and_then(Value::as_str).unwrap_or("");
            let result = match method {
                "tools/list" => json!({ "tools": behavior.tools }),
                "resources/list" => json!({ "resources": behavior.resources }),
                "resources/templates/list" => json!({ "resourceTemplates": [] }),
                "resources/read" => {
                    let uri = body
                        .get("params")
                        .and_then(|p| p.get("uri"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    match uri
                        .strip_prefix("lm-tools://schema/")
                        .and_then(|name| behavior.schemas.get(name))
                    {
                        Some(text) => json!({
                            "contents": [{ "uri": uri, "mimeType": "application/json", "text": text }],
                        }),
                        None => {
                            return respond(
                                StatusCode::OK,
                                json!({
                                    "jsonrpc": "2.0",
                                    "id": id,
                                    "error": { "code": -32002, "message": "unknown resource" },
                                }),
                            );
                        }
                    }
                }
                "tools/call" => {
                    let name = body
                        .get("params")
                        .and_then(|p| p.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("?");
                    json!({
                        "content": [{ "type": "text", "text": format!("called {name}") }],
                        "isError": false,
                        // Lets tests confirm Accept preservation end to end.
                        "acceptSeen": accept,
                    })
                }
                _ => json!({}),
            };

            respond(
                StatusCode::OK,
                json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            )
        }
        _ => respond(StatusCode::NOT_FOUND, json!({ "ok": false })),
    }
}

fn respond(status: StatusCode, value: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// A backend whose `/mcp/health` answers 200 but whose `/mcp` endpoint
/// drops the connection without a response (transport failure while
/// "healthy"). Exercises the re-resolve retry path.
pub fn spawn_half_broken_backend() -> (u16, JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind backend");
    let port = listener.local_addr().expect("local addr").port();
    listener.set_nonblocking(true).expect("nonblocking");

    let handle = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::from_std(listener).expect("tokio listener");
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]);
                if head.starts_with("GET /mcp/health") {
                    let body = r#"{"ok":true}"#;
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(reply.as_bytes()).await;
                }
                // Anything else: close without responding.
            });
        }
    });

    (port, handle)
}
