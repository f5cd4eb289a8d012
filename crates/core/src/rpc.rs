// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-RPC 2.0 message model for the public MCP endpoint.
//!
//! Incoming bodies are arbitrary JSON; this module turns them into an
//! explicit sum type instead of scattering key probing through the broker.
//! Malformed shapes surface as [`RpcParseError`] and map onto the standard
//! error codes.

use serde_json::{json, Value};
use thiserror::Error;

/// JSON-RPC error codes used by the broker.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object (also: unknown session).
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// No target resolvable for this session.
    pub const MANAGER_UNREACHABLE: i64 = -32003;
    /// Handshake cwd has no matching editor instance.
    pub const NO_MATCH: i64 = -32004;
    /// Request arrived before the workspace handshake.
    pub const WORKSPACE_NOT_SET: i64 = -32005;
    /// The chosen target failed its health check.
    pub const MCP_OFFLINE: i64 = -32006;
}

/// One parsed JSON-RPC message.
///
/// `id` stays a raw [`Value`] because the protocol allows strings, numbers,
/// and null, and responses must echo the id byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A client-to-server response (e.g. the reply to a broker-initiated
    /// `roots/list`). Has an id and a result or error, but no method.
    Response {
        id: Value,
        result: Option<Value>,
        error: Option<Value>,
    },
}

/// Why a JSON value failed to parse as a JSON-RPC message.
#[derive(Debug, Error, PartialEq)]
pub enum RpcParseError {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("jsonrpc field missing or not \"2.0\"")]
    BadVersion,

    #[error("method is not a string")]
    BadMethod,

    #[error("message has neither method nor result/error")]
    NoBody,

    #[error("batch requests are not supported")]
    Batch,
}

impl RpcMessage {
    /// Parse a JSON value into a message, validating the envelope.
    pub fn parse(value: &Value) -> Result<Self, RpcParseError> {
        if value.is_array() {
            return Err(RpcParseError::Batch);
        }
        let obj = value.as_object().ok_or(RpcParseError::NotAnObject)?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some("2.0") => {}
            _ => return Err(RpcParseError::BadVersion),
        }

        let id = obj.get("id").cloned().filter(|v| !v.is_null());

        match obj.get("method") {
            Some(m) => {
                let method = m.as_str().ok_or(RpcParseError::BadMethod)?.to_string();
                let params = obj.get("params").cloned();
                match id {
                    Some(id) => Ok(RpcMessage::Request { id, method, params }),
                    None => Ok(RpcMessage::Notification { method, params }),
                }
            }
            None => {
                let result = obj.get("result").cloned();
                let error = obj.get("error").cloned();
                if result.is_none() && error.is_none() {
                    return Err(RpcParseError::NoBody);
                }
                let id = id.ok_or(RpcParseError::NoBody)?;
                Ok(RpcMessage::Response { id, result, error })
            }
        }
    }

    /// The method name, when this is a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            RpcMessage::Request { method, .. } | RpcMessage::Notification { method, .. } => {
                Some(method)
            }
            RpcMessage::Response { .. } => None,
        }
    }
}

impl RpcParseError {
    /// The JSON-RPC error code this parse failure maps onto.
    pub fn code(&self) -> i64 {
        match self {
            RpcParseError::NotAnObject | RpcParseError::NoBody | RpcParseError::Batch => {
                error_codes::INVALID_REQUEST
            }
            RpcParseError::BadVersion | RpcParseError::BadMethod => error_codes::INVALID_REQUEST,
        }
    }
}

/// A broker-side failure destined for a JSON-RPC error response.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message} ({code})")]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    /// Render as a JSON-RPC error response echoing `id`.
    pub fn to_response(&self, id: &Value) -> Value {
        response_error(id, self.code, &self.message)
    }
}

/// Build a success response echoing `id`.
pub fn response_ok(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response echoing `id`.
pub fn response_error(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Build an error response carrying structured `data`.
pub fn response_error_with_data(id: &Value, code: i64, message: &str, data: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message, "data": data },
    })
}

/// Build a server-initiated request (used for `roots/list` over SSE).
pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
