// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Port allocation for editor-hosted servers.
//!
//! Allocation is not a bind: the broker hands out a port it believes is
//! unused (live ports ∪ fresh reservations), records a reservation, and the
//! caller confirms by heartbeating with that port. Implemented on
//! [`Registry`] so the used-set is computed under the same lock heartbeats
//! take.

use std::collections::HashSet;
use std::time::Instant;

use thiserror::Error;

use lmb_core::InstanceId;

use crate::registry::{PortReservation, Registry, PORT_RESERVATION_TTL, REGISTRY_TTL};

/// Why an allocation request failed.
#[derive(Debug, Error, PartialEq)]
pub enum AllocateError {
    #[error("preferred port must be non-zero")]
    InvalidPort,

    #[error("no free port at or above {start}")]
    PortExhausted { start: u16 },
}

impl Registry {
    /// Hand out a unique port at or above `max(min_port, preferred_port)`.
    ///
    /// Idempotent for an instance that already heartbeats with a valid port,
    /// and for a still-fresh reservation that satisfies the floor.
    pub fn allocate(
        &self,
        instance_id: &InstanceId,
        preferred_port: u16,
        min_port: Option<u16>,
        now: Instant,
    ) -> Result<u16, AllocateError> {
        if preferred_port == 0 {
            return Err(AllocateError::InvalidPort);
        }
        let start = min_port.unwrap_or(preferred_port).max(preferred_port);

        let mut inner = self.inner.lock();

        // Already live with a confirmed port: same answer every time.
        if let Some(record) = inner.records.get(instance_id) {
            if record.is_live(now, REGISTRY_TTL) && record.port != 0 {
                return Ok(record.port);
            }
        }

        // A fresh reservation that still satisfies the floor is reused;
        // anything else held by this instance is dropped before probing.
        if let Some(existing) = inner.reservations.get(instance_id) {
            let fresh =
                now.saturating_duration_since(existing.reserved_at) <= PORT_RESERVATION_TTL;
            if fresh && existing.port >= start {
                return Ok(existing.port);
            }
            inner.reservations.remove(instance_id);
        }

        let used: HashSet<u16> = inner
            .records
            .values()
            .filter(|r| r.is_live(now, REGISTRY_TTL))
            .map(|r| r.port)
            .chain(
                inner
                    .reservations
                    .values()
                    .filter(|r| {
                        now.saturating_duration_since(r.reserved_at) <= PORT_RESERVATION_TTL
                    })
                    .map(|r| r.port),
            )
            .collect();

        let mut candidate = start;
        loop {
            if !used.contains(&candidate) {
                inner.reservations.insert(
                    instance_id.clone(),
                    PortReservation {
                        instance_id: instance_id.clone(),
                        port: candidate,
                        reserved_at: now,
                    },
                );
                inner.last_non_empty_at = now;
                return Ok(candidate);
            }
            candidate = match candidate.checked_add(1) {
                Some(next) => next,
                None => return Err(AllocateError::PortExhausted { start }),
            };
        }
    }
}

#[cfg(test)]
#[path = "ports_tests.rs"]
mod tests;
