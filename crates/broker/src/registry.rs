// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Liveness registry of editor-hosted tool servers.
//!
//! Instance records and port reservations live under one mutex so the
//! multi-step invariants hold: a heartbeat that lands during an allocation
//! observes the reservation atomically, and the pruner can never race an
//! `upsert` into resurrecting a dead record.
//!
//! `last_non_empty_at` feeds idle shutdown: once records and reservations
//! are both gone for [`IDLE_GRACE`], the broker exits cleanly.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use lmb_core::{InstanceAnnouncement, InstanceId, InstanceRecord, InstanceSnapshot, MatchScore};

/// An entry is live while `now - last_seen <= REGISTRY_TTL`.
pub const REGISTRY_TTL: Duration = Duration::from_millis(2500);

/// A reservation expires if no heartbeat confirms it within this window.
pub const PORT_RESERVATION_TTL: Duration = Duration::from_secs(10);

/// How long the broker stays up after the last instance/reservation is gone.
pub const IDLE_GRACE: Duration = Duration::from_secs(10);

/// A port handed out by `/allocate`, awaiting heartbeat confirmation.
#[derive(Debug, Clone)]
pub struct PortReservation {
    pub instance_id: InstanceId,
    pub port: u16,
    pub reserved_at: Instant,
}

impl PortReservation {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.reserved_at) <= PORT_RESERVATION_TTL
    }
}

/// Wire view of a [`PortReservation`] for `/list` and the status page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReservationSnapshot {
    pub instance_id: InstanceId,
    pub port: u16,
    pub age_ms: u64,
}

pub(crate) struct RegistryInner {
    pub records: HashMap<InstanceId, InstanceRecord>,
    pub reservations: HashMap<InstanceId, PortReservation>,
    pub last_non_empty_at: Instant,
}

/// Registry of live instances plus pending port reservations.
pub struct Registry {
    pub(crate) inner: Mutex<RegistryInner>,
}

/// What a prune pass removed, for logging.
#[derive(Debug, Default, PartialEq)]
pub struct PruneOutcome {
    pub expired_instances: Vec<InstanceId>,
    pub expired_reservations: Vec<InstanceId>,
}

impl Registry {
    pub fn new(now: Instant) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                records: HashMap::new(),
                reservations: HashMap::new(),
                last_non_empty_at: now,
            }),
        }
    }

    /// Create or refresh a record from a heartbeat. Preserves `started_at_ms`
    /// across refreshes and clears any reservation held by this instance
    /// (the heartbeat is the bind confirmation).
    pub fn upsert(
        &self,
        ann: InstanceAnnouncement,
        now: Instant,
        now_ms: u64,
    ) -> InstanceSnapshot {
        let mut inner = self.inner.lock();
        inner.reservations.remove(&ann.instance_id);

        // (host, port) is unique across live records: an editor restart can
        // re-claim its old port under a new instance id, superseding the
        // stale record immediately instead of waiting out its TTL.
        inner.records.retain(|id, record| {
            *id == ann.instance_id || record.host != ann.host || record.port != ann.port
        });

        let record = match inner.records.entry(ann.instance_id.clone()) {
            Entry::Occupied(entry) => {
                let record = entry.into_mut();
                record.refresh(ann, now);
                record
            }
            Entry::Vacant(entry) => {
                entry.insert(InstanceRecord::from_announcement(ann, now, now_ms))
            }
        };
        let snapshot = record.snapshot(now);
        inner.last_non_empty_at = now;
        snapshot
    }

    /// Explicit departure (`/bye`). Also drops any reservation.
    pub fn remove(&self, instance_id: &InstanceId) -> bool {
        let mut inner = self.inner.lock();
        inner.reservations.remove(instance_id);
        inner.records.remove(instance_id).is_some()
    }

    /// Snapshot of all non-expired records.
    pub fn live(&self, now: Instant) -> Vec<InstanceRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .values()
            .filter(|r| r.is_live(now, REGISTRY_TTL))
            .cloned()
            .collect()
    }

    /// Best-fit instance for a normalized cwd.
    ///
    /// Highest [`MatchScore`] wins; ties break on the largest `last_seen`.
    /// Deterministic for a fixed registry state and input.
    pub fn match_cwd(&self, cwd_norm: &str, now: Instant) -> Option<InstanceRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .values()
            .filter(|r| r.is_live(now, REGISTRY_TTL))
            .map(|r| (r.match_score(cwd_norm), r))
            .filter(|(score, _)| *score > MatchScore::None)
            .max_by(|(sa, ra), (sb, rb)| {
                sa.cmp(sb)
                    .then(ra.last_seen.cmp(&rb.last_seen))
                    // Final tie-break: lowest instance id wins.
                    .then(rb.instance_id.as_str().cmp(ra.instance_id.as_str()))
            })
            .map(|(_, r)| r.clone())
    }

    /// Drop expired records and stale reservations; refresh `last_non_empty_at`
    /// while anything is still alive.
    pub fn prune(&self, now: Instant) -> PruneOutcome {
        let mut inner = self.inner.lock();
        let mut outcome = PruneOutcome::default();

        let expired: Vec<InstanceId> = inner
            .records
            .iter()
            .filter(|(_, r)| !r.is_live(now, REGISTRY_TTL))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            inner.records.remove(&id);
            outcome.expired_instances.push(id);
        }

        let stale: Vec<InstanceId> = inner
            .reservations
            .iter()
            .filter(|(_, r)| !r.is_fresh(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            inner.reservations.remove(&id);
            outcome.expired_reservations.push(id);
        }

        if !inner.records.is_empty() || !inner.reservations.is_empty() {
            inner.last_non_empty_at = now;
        }

        outcome
    }

    /// True once records and reservations have both been empty for
    /// [`IDLE_GRACE`] (measured from `last_non_empty_at`).
    pub fn idle_expired(&self, now: Instant, grace: Duration) -> bool {
        let inner = self.inner.lock();
        inner.records.is_empty()
            && inner.reservations.is_empty()
            && now.saturating_duration_since(inner.last_non_empty_at) >= grace
    }

    /// Live instance count (for status).
    pub fn live_count(&self, now: Instant) -> usize {
        let inner = self.inner.lock();
        inner
            .records
            .values()
            .filter(|r| r.is_live(now, REGISTRY_TTL))
            .count()
    }

    /// Snapshot of pending reservations (for `/list` and the status page).
    pub fn reservation_snapshots(&self, now: Instant) -> Vec<ReservationSnapshot> {
        let inner = self.inner.lock();
        inner
            .reservations
            .values()
            .map(|r| ReservationSnapshot {
                instance_id: r.instance_id.clone(),
                port: r.port,
                age_ms: now.saturating_duration_since(r.reserved_at).as_millis() as u64,
            })
            .collect()
    }

    /// Serializable snapshots of all live instances.
    pub fn live_snapshots(&self, now: Instant) -> Vec<InstanceSnapshot> {
        let mut snaps: Vec<InstanceSnapshot> = self
            .live(now)
            .iter()
            .map(|r| r.snapshot(now))
            .collect();
        snaps.sort_by(|a, b| a.instance_id.as_str().cmp(b.instance_id.as_str()));
        snaps
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
