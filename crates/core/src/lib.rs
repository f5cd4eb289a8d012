// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! lmb-core: Domain types for the lm-tools-bridge manager.
//!
//! Pure data and logic, no I/O: instance records and workspace matching,
//! MCP session state, the JSON-RPC message model, and the clock seam.

pub mod clock;
pub mod id;
pub mod instance;
pub mod paths;
pub mod rpc;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use clock::{Clock, FakeClock, SystemClock};
pub use id::{fresh_id, ShortId};
pub use instance::{
    InstanceAnnouncement, InstanceId, InstanceRecord, InstanceSnapshot, MatchScore,
};
pub use paths::{is_descendant, normalize_path};
pub use rpc::{error_codes, RpcFailure, RpcMessage, RpcParseError};
pub use session::{
    ClientCapabilities, PendingRoots, RootsReason, RootsSyncRecord, Session, SessionId,
    SessionSummary, TargetSnapshot,
};
