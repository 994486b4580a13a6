//! Desired/actual state for the reconciler.
//!
//! The `StateStore` is owned and mutated exclusively by the reconciler's
//! event loop; everyone else gets at most the read-only `TrackedWorkers`
//! snapshot it publishes after each mutation.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::FeedSpec;

/// Status of a worker as believed by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Launching,
    Running,
    Degraded,
    Stopping,
    Absent,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Launching => "launching",
            WorkerStatus::Running => "running",
            WorkerStatus::Degraded => "degraded",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Absent => "absent",
        }
    }
}

/// Handle for one worker. At most one non-Absent handle exists per feed name;
/// an Absent feed simply has no entry in the actual map.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub feed_name: String,
    /// Runtime identifier, present once the launch call returned. A Degraded
    /// worker that never came up has none.
    pub runtime_id: Option<String>,
    /// Hash of the FeedSpec the worker was launched from.
    pub spec_hash: String,
    pub status: WorkerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
}

/// Read-only view of tracked workers (feed name -> runtime id), published by
/// the reconciler for the health monitor.
pub type TrackedWorkers = Arc<RwLock<HashMap<String, String>>>;

/// Desired and actual maps, plus the bookkeeping the reconciler needs to
/// serialize per-feed operations.
pub struct StateStore {
    desired: HashMap<String, FeedSpec>,
    desired_hashes: HashMap<String, String>,
    actual: HashMap<String, WorkerHandle>,
    in_flight: HashSet<String>,
    /// Feeds whose worker died with `failure_is_fatal` set. Stay Absent and
    /// are never relaunched until their config entry is re-applied.
    suspended: HashMap<String, String>,
    tracked: TrackedWorkers,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            desired: HashMap::new(),
            desired_hashes: HashMap::new(),
            actual: HashMap::new(),
            in_flight: HashSet::new(),
            suspended: HashMap::new(),
            tracked: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // ---- desired state ----------------------------------------------------

    /// Insert or replace a desired entry. Re-applying configuration clears a
    /// fatal-failure suspension for the feed.
    pub fn upsert_desired(&mut self, spec: FeedSpec) {
        self.suspended.remove(&spec.name);
        self.desired_hashes
            .insert(spec.name.clone(), spec.spec_hash());
        self.desired.insert(spec.name.clone(), spec);
    }

    pub fn remove_desired(&mut self, name: &str) -> bool {
        self.suspended.remove(name);
        self.desired_hashes.remove(name);
        self.desired.remove(name).is_some()
    }

    pub fn desired(&self, name: &str) -> Option<&FeedSpec> {
        self.desired.get(name)
    }

    pub fn desired_hash(&self, name: &str) -> Option<&str> {
        self.desired_hashes.get(name).map(|h| h.as_str())
    }

    // ---- actual state -----------------------------------------------------

    pub fn actual(&self, name: &str) -> Option<&WorkerHandle> {
        self.actual.get(name)
    }

    pub fn status(&self, name: &str) -> WorkerStatus {
        self.actual
            .get(name)
            .map(|h| h.status)
            .unwrap_or(WorkerStatus::Absent)
    }

    pub fn insert_actual(&mut self, handle: WorkerHandle) {
        self.actual.insert(handle.feed_name.clone(), handle);
        self.publish();
    }

    pub fn set_status(&mut self, name: &str, status: WorkerStatus) {
        if let Some(handle) = self.actual.get_mut(name) {
            handle.status = status;
        }
        self.publish();
    }

    /// Transition a feed to Absent: the entry leaves the actual map.
    /// Returns the removed handle, if any.
    pub fn set_absent(&mut self, name: &str) -> Option<WorkerHandle> {
        let removed = self.actual.remove(name);
        self.publish();
        removed
    }

    pub fn actual_handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.actual.values()
    }

    // ---- suspension -------------------------------------------------------

    pub fn suspend(&mut self, name: &str, reason: String) {
        self.suspended.insert(name.to_string(), reason);
    }

    pub fn is_suspended(&self, name: &str) -> bool {
        self.suspended.contains_key(name)
    }

    // ---- in-flight markers ------------------------------------------------

    /// Atomically claim a feed for an operation. Returns false if an
    /// operation for the same name is already in flight.
    pub fn begin_op(&mut self, name: &str) -> bool {
        self.in_flight.insert(name.to_string())
    }

    pub fn end_op(&mut self, name: &str) {
        self.in_flight.remove(name);
    }

    pub fn op_in_flight(&self, name: &str) -> bool {
        self.in_flight.contains(name)
    }

    pub fn any_op_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    // ---- published snapshot -----------------------------------------------

    pub fn tracked(&self) -> TrackedWorkers {
        self.tracked.clone()
    }

    /// Rebuild the read-only snapshot: Running workers with a runtime id.
    fn publish(&self) {
        let mut view = self.tracked.write();
        view.clear();
        for handle in self.actual.values() {
            if handle.status == WorkerStatus::Running {
                if let Some(ref id) = handle.runtime_id {
                    view.insert(handle.feed_name.clone(), id.clone());
                }
            }
        }
    }

    // ---- diff -------------------------------------------------------------

    /// Names that should be stopped: non-Absent in actual but gone from
    /// desired, or launched from a spec whose hash no longer matches.
    /// In-flight names are skipped; their completion handler re-checks.
    pub fn to_stop(&self) -> Vec<String> {
        self.actual
            .values()
            .filter(|h| !self.in_flight.contains(&h.feed_name))
            .filter(|h| matches!(h.status, WorkerStatus::Running | WorkerStatus::Degraded))
            .filter(|h| {
                self.desired_hash(&h.feed_name)
                    .map(|want| want != h.spec_hash)
                    .unwrap_or(true)
            })
            .map(|h| h.feed_name.clone())
            .collect()
    }

    /// Names that should be launched: desired, currently Absent, not
    /// mid-flight and not suspended.
    pub fn to_launch(&self) -> Vec<String> {
        self.desired
            .keys()
            .filter(|name| self.status(name) == WorkerStatus::Absent)
            .filter(|name| !self.in_flight.contains(*name))
            .filter(|name| !self.suspended.contains_key(*name))
            .cloned()
            .collect()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
