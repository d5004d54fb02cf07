//! Domain types for the NodeFleet state store.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Unique identifier for a managed cluster.
pub type ClusterId = String;

/// Opaque token identifying the invocation holding a cluster lock.
pub type LockToken = String;

// ── Metrics ───────────────────────────────────────────────────────

/// Point-in-time cluster load reading. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    /// Unix timestamp (seconds) of collection.
    pub timestamp: u64,
    /// Cluster-average CPU utilization (0-100).
    pub cpu_percent: f64,
    /// Cluster-average memory utilization (0-100).
    pub memory_percent: f64,
    /// Work items the workload scheduler cannot place.
    pub pending_work_items: u32,
    /// Ready worker nodes as reported by the metrics service.
    pub node_count: u32,
    /// Application signals such as `queue_depth` or `latency_p95_ms`.
    #[serde(default)]
    pub custom: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn new(
        timestamp: u64,
        cpu_percent: f64,
        memory_percent: f64,
        pending_work_items: u32,
        node_count: u32,
    ) -> Self {
        Self {
            timestamp,
            cpu_percent,
            memory_percent,
            pending_work_items,
            node_count,
            custom: BTreeMap::new(),
        }
    }

    /// Age of this reading at `now`, in seconds.
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    /// Build the composite key for the metrics archive table.
    pub fn archive_key(&self, cluster_id: &str) -> String {
        format!("{cluster_id}:{:020}", self.timestamp)
    }
}

/// Bounded, ordered metrics history. Oldest reading is evicted on insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsHistory {
    capacity: usize,
    readings: VecDeque<MetricsSnapshot>,
}

impl Default for MetricsHistory {
    fn default() -> Self {
        Self::with_capacity(6)
    }
}

impl MetricsHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            readings: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a reading, evicting the oldest when full.
    pub fn push(&mut self, snapshot: MetricsSnapshot) {
        while self.readings.len() >= self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(snapshot);
    }

    /// Change the capacity, dropping the oldest readings if it shrinks.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.readings.len() > self.capacity {
            self.readings.pop_front();
        }
    }

    /// Most recent reading.
    pub fn latest(&self) -> Option<&MetricsSnapshot> {
        self.readings.back()
    }

    /// Remove and return the most recent reading.
    pub fn pop_latest(&mut self) -> Option<MetricsSnapshot> {
        self.readings.pop_back()
    }

    /// The last `n` readings, newest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &MetricsSnapshot> {
        self.readings.iter().rev().take(n)
    }

    /// Oldest-to-newest iteration.
    pub fn iter(&self) -> impl Iterator<Item = &MetricsSnapshot> {
        self.readings.iter()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

// ── Cluster state ─────────────────────────────────────────────────

/// Direction of the last scaling action taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    #[default]
    None,
}

/// The single coordination record for a managed cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterState {
    pub cluster_id: ClusterId,
    /// Current worker count as last recorded by the lock holder.
    pub node_count: u32,
    /// False until the first cycle records an observed node count.
    #[serde(default)]
    pub initialized: bool,
    pub lock_holder: Option<LockToken>,
    pub lock_acquired_at: Option<u64>,
    #[serde(default)]
    pub lock_released_at: Option<u64>,
    pub last_scale_time: Option<u64>,
    #[serde(default)]
    pub last_scale_action: ScaleAction,
    #[serde(default)]
    pub metrics_history: MetricsHistory,
    /// Collections that failed in a row; reset on the next success.
    #[serde(default)]
    pub consecutive_metric_failures: u32,
    #[serde(default)]
    pub updated_at: u64,
}

impl ClusterState {
    /// A fresh, unlocked, uninitialized record.
    pub fn new(cluster_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            node_count: 0,
            initialized: false,
            lock_holder: None,
            lock_acquired_at: None,
            lock_released_at: None,
            last_scale_time: None,
            last_scale_action: ScaleAction::None,
            metrics_history: MetricsHistory::default(),
            consecutive_metric_failures: 0,
            updated_at: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_holder.is_some()
    }

    /// Whether the current lock has outlived `ttl_secs` at `now`.
    ///
    /// A holder without an acquisition time is treated as expired.
    pub fn lock_expired(&self, now: u64, ttl_secs: u64) -> bool {
        match (self.lock_holder.as_ref(), self.lock_acquired_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(at)) => now.saturating_sub(at) > ttl_secs,
        }
    }

    /// Merge the `Some` fields of an update (last writer wins per field).
    pub fn apply(&mut self, update: StateUpdate) {
        if let Some(n) = update.node_count {
            self.node_count = n;
        }
        if let Some(i) = update.initialized {
            self.initialized = i;
        }
        if let Some(t) = update.last_scale_time {
            self.last_scale_time = Some(t);
        }
        if let Some(a) = update.last_scale_action {
            self.last_scale_action = a;
        }
        if let Some(h) = update.metrics_history {
            self.metrics_history = h;
        }
        if let Some(f) = update.consecutive_metric_failures {
            self.consecutive_metric_failures = f;
        }
    }
}

/// Field-level update for `StateStore::update_state`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub node_count: Option<u32>,
    pub initialized: Option<bool>,
    pub last_scale_time: Option<u64>,
    pub last_scale_action: Option<ScaleAction>,
    pub metrics_history: Option<MetricsHistory>,
    pub consecutive_metric_failures: Option<u32>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        *self == StateUpdate::default()
    }
}

// ── Scaling journal ───────────────────────────────────────────────

/// Kind of a notification/journal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ScaleUp,
    ScaleDown,
    /// Scale-up where some launched nodes never became ready.
    PartialScaleUp,
    /// A removal abandoned because it would break a disruption budget or
    /// the drain did not finish in time.
    SafetyBlocked,
    /// Spot nodes reclaimed by the provider were replaced.
    SpotInterruption,
    /// Metrics could not be collected for too many cycles in a row.
    MetricsUnavailable,
    /// The cycle aborted on an unexpected error.
    CycleFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ScaleUp => "scale_up",
            EventKind::ScaleDown => "scale_down",
            EventKind::PartialScaleUp => "partial_scale_up",
            EventKind::SafetyBlocked => "safety_blocked",
            EventKind::SpotInterruption => "spot_interruption",
            EventKind::MetricsUnavailable => "metrics_unavailable",
            EventKind::CycleFailed => "cycle_failed",
        }
    }

    /// Whether this event records a change in node count.
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            EventKind::ScaleUp
                | EventKind::ScaleDown
                | EventKind::PartialScaleUp
                | EventKind::SpotInterruption
        )
    }
}

/// A published scaling event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    pub kind: EventKind,
    pub cluster_id: ClusterId,
    /// Nodes added or removed (0 for diagnostics).
    pub delta: u32,
    pub reason: String,
    pub timestamp: u64,
}

impl ScalingEvent {
    pub fn new(kind: EventKind, cluster_id: &str, delta: u32, reason: impl Into<String>, timestamp: u64) -> Self {
        Self {
            kind,
            cluster_id: cluster_id.to_string(),
            delta,
            reason: reason.into(),
            timestamp,
        }
    }

    /// Build the composite key for the events table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.cluster_id, self.timestamp, self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(ts: u64, cpu: f64) -> MetricsSnapshot {
        MetricsSnapshot::new(ts, cpu, 40.0, 0, 3)
    }

    #[test]
    fn history_evicts_oldest_when_full() {
        let mut history = MetricsHistory::with_capacity(3);
        for ts in 1..=5 {
            history.push(snap(ts, 50.0));
        }
        assert_eq!(history.len(), 3);
        let ts: Vec<u64> = history.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![3, 4, 5]);
        assert_eq!(history.latest().map(|s| s.timestamp), Some(5));
    }

    #[test]
    fn history_recent_is_newest_first() {
        let mut history = MetricsHistory::with_capacity(6);
        for ts in 1..=4 {
            history.push(snap(ts, ts as f64));
        }
        let recent: Vec<u64> = history.recent(2).map(|s| s.timestamp).collect();
        assert_eq!(recent, vec![4, 3]);
    }

    #[test]
    fn history_resize_keeps_newest() {
        let mut history = MetricsHistory::with_capacity(6);
        for ts in 1..=6 {
            history.push(snap(ts, 50.0));
        }
        history.resize(2);
        let ts: Vec<u64> = history.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![5, 6]);
    }

    #[test]
    fn lock_expiry_uses_strict_ttl() {
        let mut state = ClusterState::new("c1");
        assert!(!state.lock_expired(1000, 300));

        state.lock_holder = Some("t".to_string());
        state.lock_acquired_at = Some(1000);
        assert!(!state.lock_expired(1300, 300));
        assert!(state.lock_expired(1301, 300));
    }

    #[test]
    fn holder_without_timestamp_counts_as_expired() {
        let mut state = ClusterState::new("c1");
        state.lock_holder = Some("t".to_string());
        assert!(state.lock_expired(0, 300));
    }

    #[test]
    fn apply_merges_only_present_fields() {
        let mut state = ClusterState::new("c1");
        state.node_count = 4;
        state.apply(StateUpdate {
            last_scale_time: Some(500),
            last_scale_action: Some(ScaleAction::ScaleUp),
            ..Default::default()
        });
        assert_eq!(state.node_count, 4);
        assert_eq!(state.last_scale_time, Some(500));
        assert_eq!(state.last_scale_action, ScaleAction::ScaleUp);
    }

    #[test]
    fn state_serializes_with_snake_case_action() {
        let mut state = ClusterState::new("c1");
        state.last_scale_action = ScaleAction::ScaleDown;
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"scale_down\""));
        let back: ClusterState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
