// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Public MCP endpoint on loopback TCP.
//!
//! One hyper service routes `/mcp` (JSON-RPC + SSE), session deletion,
//! health, the status page, and the log tail. Each request body is handled
//! in its own spawned task so a panic surfaces as a 500 JSON-RPC error
//! instead of tearing the broker down.

use std::convert::Infallible;
use std::net::TcpListener;
use std::sync::Arc;

use hyper::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, error};

use lmb_core::rpc::{self, error_codes};
use lmb_core::SessionId;

use crate::lifecycle::BrokerCtx;
use crate::logbuf::LOG_RING_CAPACITY;
use crate::mcp::{self, MCP_SESSION_HEADER};
use crate::status_page;

/// Run the public HTTP listener until the shutdown future resolves.
///
/// The listener must already be bound (and non-blocking); binding happens in
/// lifecycle startup so bind errors map onto exit codes before serving.
pub async fn serve(
    ctx: Arc<BrokerCtx>,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let make_service = make_service_fn(move |_conn| {
        let ctx = Arc::clone(&ctx);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                async move { Ok::<_, Infallible>(route(ctx, req).await) }
            }))
        }
    });

    Server::from_tcp(listener)?
        .serve(make_service)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn route(ctx: Arc<BrokerCtx>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::POST, "/mcp") => handle_mcp_post(ctx, req).await,
        (Method::DELETE, "/mcp") => handle_mcp_delete(ctx, req),
        (Method::GET, "/mcp/health") => json_body(StatusCode::OK, &json!({ "ok": true })),
        (Method::GET, "/mcp/status") => handle_status(ctx, req),
        (Method::GET, "/mcp/log") => handle_log(ctx, req),
        _ => {
            debug!(%path, "no route");
            json_body(StatusCode::NOT_FOUND, &json!({ "ok": false, "reason": "not_found" }))
        }
    }
}

/// `POST /mcp`: read the body, then dispatch on a separate task so an
/// unexpected panic in a handler produces a 500 JSON-RPC response.
async fn handle_mcp_post(ctx: Arc<BrokerCtx>, req: Request<Body>) -> Response<Body> {
    let session_header = header_string(&req, MCP_SESSION_HEADER);
    let accept = req
        .headers()
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return json_body(
                StatusCode::OK,
                &rpc::response_error(
                    &Value::Null,
                    error_codes::INVALID_REQUEST,
                    &format!("failed to read request body: {err}"),
                ),
            );
        }
    };

    let handle = tokio::spawn(async move {
        mcp::dispatch(
            ctx.as_ref(),
            session_header.as_deref(),
            accept.as_deref(),
            body,
        )
        .await
    });

    match handle.await {
        Ok(response) => response,
        Err(join_err) => {
            error!(error = %join_err, "mcp dispatch task failed");
            json_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                &rpc::response_error(
                    &Value::Null,
                    error_codes::INTERNAL_ERROR,
                    "internal broker error",
                ),
            )
        }
    }
}

fn handle_mcp_delete(ctx: Arc<BrokerCtx>, req: Request<Body>) -> Response<Body> {
    let Some(raw) = header_string(&req, MCP_SESSION_HEADER) else {
        return json_body(
            StatusCode::BAD_REQUEST,
            &json!({ "ok": false, "reason": "missing_session_header" }),
        );
    };

    if ctx.sessions.remove(&SessionId::new(raw.as_str())) {
        debug!(session_id = %raw, "session deleted");
        json_body(StatusCode::OK, &json!({ "ok": true }))
    } else {
        json_body(
            StatusCode::NOT_FOUND,
            &json!({ "ok": false, "reason": "unknown_session" }),
        )
    }
}

fn handle_status(ctx: Arc<BrokerCtx>, req: Request<Body>) -> Response<Body> {
    let inputs = ctx.status_inputs();

    let wants_html = req
        .uri()
        .query()
        .is_some_and(|q| q.split('&').any(|kv| kv == "format=html"))
        || header_string(&req, ACCEPT.as_str())
            .is_some_and(|accept| accept.contains("text/html"));

    if wants_html {
        let mut response = Response::new(Body::from(status_page::status_html(&inputs)));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    } else {
        json_body(StatusCode::OK, &status_page::status_json(&inputs))
    }
}

fn handle_log(ctx: Arc<BrokerCtx>, req: Request<Body>) -> Response<Body> {
    let lines = req
        .uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|kv| kv.strip_prefix("lines="))
                .and_then(|v| v.parse::<usize>().ok())
        })
        .unwrap_or(LOG_RING_CAPACITY)
        .min(LOG_RING_CAPACITY);

    let tail = ctx.logbuf.tail(lines).join("\n");
    let mut response = Response::new(Body::from(tail));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn header_string(req: &Request<Body>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn json_body(status: StatusCode, value: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
