//! Per-organization writer lanes.
//!
//! Each organization gets one [`OrgLane`]: a writer mutex that serializes
//! full-sync upserts and webhook application, the sync state machine
//! (`Idle → Syncing(Listing → Detailing → Reconciling) → Idle`), a
//! cooperative cancel flag, the memory of applied webhook events, and
//! tombstones of recent removals.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::progress::SyncPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing(SyncPhase),
}

#[derive(Debug)]
pub(crate) struct OrgLane {
    /// Held for one record (full sync) or one event (webhook) at a time.
    pub writer: tokio::sync::Mutex<()>,
    state: Mutex<SyncState>,
    cancel: AtomicBool,
    applied: Mutex<AppliedEvents>,
    removals: Mutex<Tombstones>,
}

impl OrgLane {
    fn new(dedup_capacity: usize) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(()),
            state: Mutex::new(SyncState::Idle),
            cancel: AtomicBool::new(false),
            applied: Mutex::new(AppliedEvents::new(dedup_capacity)),
            removals: Mutex::new(Tombstones::new(dedup_capacity)),
        }
    }

    /// Move `Idle → Syncing(Listing)`. `None` when a sync is already
    /// running, in which case the caller coalesces into it.
    pub fn try_begin_sync(self: &Arc<Self>) -> Option<SyncGuard> {
        let mut state = lock(&self.state);
        if *state != SyncState::Idle {
            return None;
        }
        *state = SyncState::Syncing(SyncPhase::Listing);
        self.cancel.store(false, Ordering::Release);
        Some(SyncGuard {
            lane: Arc::clone(self),
        })
    }

    pub fn state(&self) -> SyncState {
        *lock(&self.state)
    }

    /// Ask a running sync to stop at the next contact boundary.
    pub fn request_cancel(&self) -> bool {
        let state = lock(&self.state);
        if *state == SyncState::Idle {
            return false;
        }
        self.cancel.store(true, Ordering::Release);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn has_applied(&self, contact_id: &str, event_id: &str) -> bool {
        lock(&self.applied).contains(contact_id, event_id)
    }

    pub fn mark_applied(&self, contact_id: &str, event_id: &str) {
        lock(&self.applied).insert(contact_id, event_id);
    }

    /// Remember that `contact_id` was removed at `at`. Call with the
    /// writer held.
    pub fn record_removal(&self, contact_id: &str, at: DateTime<Utc>) {
        lock(&self.removals).insert(contact_id, at);
    }

    /// True if `contact_id` was removed after `since`. A record read from
    /// the remote before that removal must not bring the contact back.
    pub fn removed_since(&self, contact_id: &str, since: DateTime<Utc>) -> bool {
        lock(&self.removals).removed_after(contact_id, since)
    }
}

/// Returns the lane to `Idle` when dropped, whatever way the sync ends.
pub(crate) struct SyncGuard {
    lane: Arc<OrgLane>,
}

impl SyncGuard {
    pub fn set_phase(&self, phase: SyncPhase) {
        *lock(&self.lane.state) = SyncState::Syncing(phase);
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        *lock(&self.lane.state) = SyncState::Idle;
        self.lane.cancel.store(false, Ordering::Release);
    }
}

/// Lane registry, created on first use per organization.
#[derive(Debug)]
pub(crate) struct Lanes {
    lanes: Mutex<HashMap<String, Arc<OrgLane>>>,
    dedup_capacity: usize,
}

impl Lanes {
    pub fn new(dedup_capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            dedup_capacity,
        }
    }

    pub fn get(&self, organization_id: &str) -> Arc<OrgLane> {
        let mut lanes = lock(&self.lanes);
        Arc::clone(
            lanes
                .entry(organization_id.to_string())
                .or_insert_with(|| Arc::new(OrgLane::new(self.dedup_capacity))),
        )
    }

    pub fn existing(&self, organization_id: &str) -> Option<Arc<OrgLane>> {
        lock(&self.lanes).get(organization_id).cloned()
    }
}

/// Bounded FIFO memory of applied `(contact_id, event_id)` pairs.
#[derive(Debug)]
struct AppliedEvents {
    capacity: usize,
    order: VecDeque<(String, String)>,
    seen: HashSet<(String, String)>,
}

impl AppliedEvents {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, contact_id: &str, event_id: &str) -> bool {
        self.seen
            .contains(&(contact_id.to_string(), event_id.to_string()))
    }

    fn insert(&mut self, contact_id: &str, event_id: &str) {
        let key = (contact_id.to_string(), event_id.to_string());
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

/// Bounded memory of recent removals, `contact_id -> removed_at`.
#[derive(Debug)]
struct Tombstones {
    capacity: usize,
    order: VecDeque<String>,
    removed: HashMap<String, DateTime<Utc>>,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            removed: HashMap::new(),
        }
    }

    fn insert(&mut self, contact_id: &str, at: DateTime<Utc>) {
        if self.removed.insert(contact_id.to_string(), at).is_none() {
            self.order.push_back(contact_id.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.removed.remove(&evicted);
            }
        }
    }

    fn removed_after(&self, contact_id: &str, since: DateTime<Utc>) -> bool {
        self.removed.get(contact_id).is_some_and(|at| *at > since)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
