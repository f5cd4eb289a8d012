// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane protocol between editor extensions and the broker.
//!
//! Messages travel as frames on a per-user Unix-domain socket: a 4-byte
//! big-endian length followed by a JSON payload. The socket name is derived
//! from a stable hash of the OS username so two users on one machine never
//! collide.

use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use lmb_core::{InstanceAnnouncement, InstanceId, InstanceSnapshot};

use crate::registry::ReservationSnapshot;

/// Request from an editor extension to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// Liveness ping.
    Health,

    /// Broker identity: version, pid, current time.
    Status,

    /// Snapshot of live instances and pending reservations.
    List,

    /// Announce or refresh an editor-hosted server.
    Heartbeat { instance: InstanceAnnouncement },

    /// Explicit departure.
    Bye { instance_id: InstanceId },

    /// Reserve a listening port.
    Allocate {
        instance_id: InstanceId,
        preferred_port: u16,
        #[serde(default)]
        min_port: Option<u16>,
    },

    /// Best-match lookup by cwd.
    Resolve { cwd: String },

    /// Graceful shutdown; refused when `expected_version` mismatches.
    Shutdown {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        expected_version: Option<String>,
    },
}

/// Response from the broker to an editor extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlResponse {
    /// The request took effect and has no payload to return.
    Ok,

    /// Liveness reply to [`ControlRequest::Health`].
    Pong,

    /// Broker identity and counters.
    Status {
        version: String,
        pid: u32,
        now_ms: u64,
        uptime_secs: u64,
        instances: usize,
        sessions: usize,
    },

    /// Live instances plus pending reservations.
    Instances {
        instances: Vec<InstanceSnapshot>,
        #[serde(default)]
        reservations: Vec<ReservationSnapshot>,
    },

    /// Port allocation succeeded.
    Allocated { port: u16 },

    /// No free port at or above the requested floor.
    PortExhausted,

    /// Best-match result (None when nothing matches).
    Resolved {
        instance: Option<InstanceSnapshot>,
    },

    /// Broker is shutting down (reply is written before listeners close).
    ShuttingDown,

    /// `expected_version` did not match the running broker.
    VersionMismatch { version: String },

    /// The request was understood but could not be honored.
    Error { message: String },
}

/// Control messages never come close to this; a bigger frame means a
/// confused or hostile peer.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Per-request deadline on the control socket.
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(1500);

/// Running broker version, matched by `/shutdown`'s `expected_version`.
pub const BROKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short prefix of the username hash used in the socket name.
const PIPE_HASH_LEN: usize = 12;

/// What went wrong on the control socket.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("peer closed the connection")]
    Closed,

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES}-byte cap")]
    Oversized(usize),

    #[error("deadline elapsed while {0}")]
    Deadline(&'static str),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        // EOF mid-frame is the ordinary way a peer goes away.
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(err)
        }
    }
}

/// Serialize `msg` and write it as one frame.
pub async fn send_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(WireError::Oversized(payload.len()));
    }

    // One buffer, one write: header and payload never land in separate
    // packets for a peer doing short reads.
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and deserialize it.
pub async fn recv_frame<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let declared = u32::from_be_bytes(header) as usize;
    if declared > MAX_FRAME_BYTES {
        return Err(WireError::Oversized(declared));
    }

    let mut payload = vec![0u8; declared];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// [`send_frame`] with a deadline; `what` names the operation in the error.
pub async fn send_frame_timeout<W, T>(
    writer: &mut W,
    msg: &T,
    deadline: Duration,
    what: &'static str,
) -> Result<(), WireError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    match tokio::time::timeout(deadline, send_frame(writer, msg)).await {
        Ok(result) => result,
        Err(_) => Err(WireError::Deadline(what)),
    }
}

/// [`recv_frame`] with a deadline; `what` names the operation in the error.
pub async fn recv_frame_timeout<R, T>(
    reader: &mut R,
    deadline: Duration,
    what: &'static str,
) -> Result<T, WireError>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    match tokio::time::timeout(deadline, recv_frame(reader)).await {
        Ok(result) => result,
        Err(_) => Err(WireError::Deadline(what)),
    }
}

/// Default pipe name for this user: `lm-tools-bridge-<hash>`.
pub fn default_pipe_name() -> String {
    pipe_name_for_user(&crate::env::username())
}

/// Pipe name for an explicit username (hash keeps usernames out of /tmp).
pub fn pipe_name_for_user(username: &str) -> String {
    let digest = Sha256::digest(username.as_bytes());
    let hex: String = digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    format!("lm-tools-bridge-{}", &hex[..PIPE_HASH_LEN])
}

/// Filesystem path of the control socket for a pipe name.
pub fn socket_path(pipe_name: &str) -> PathBuf {
    crate::env::runtime_dir().join(format!("{pipe_name}.sock"))
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
