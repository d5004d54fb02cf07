//! StateStore — redb-backed state persistence and locking for NodeFleet.
//!
//! Provides the cluster record (read, field-merge update), the
//! conditional-write lock, the metrics archive, and the scaling journal.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nodefleet_core::epoch_secs;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Outcome of a single conditional lock write.
enum LockAttempt {
    Acquired,
    Held { holder: LockToken, acquired_at: Option<u64> },
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(METRICS_ARCHIVE).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Cluster record ─────────────────────────────────────────────

    /// Get the cluster record, if one has ever been written.
    pub fn get_state(&self, cluster_id: &str) -> StateResult<Option<ClusterState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match table.get(cluster_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let state: ClusterState =
                    serde_json::from_slice(guard.value()).map_err(StateError::Decode)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Read the cluster record, or a fresh uninitialized one if absent.
    pub fn read_state(&self, cluster_id: &str) -> StateResult<ClusterState> {
        Ok(self
            .get_state(cluster_id)?
            .unwrap_or_else(|| ClusterState::new(cluster_id)))
    }

    /// Merge `update` into the cluster record and return the result.
    ///
    /// Does not check the lock; cycles write through
    /// [`update_state_as`](Self::update_state_as).
    pub fn update_state(&self, cluster_id: &str, update: StateUpdate) -> StateResult<ClusterState> {
        let state = self.modify(cluster_id, |state| {
            state.apply(update);
            state.updated_at = epoch_secs();
            true
        })?;
        debug!(
            cluster = %cluster_id,
            node_count = state.node_count,
            history = state.metrics_history.len(),
            "cluster state updated"
        );
        Ok(state)
    }

    /// Merge `update` only while `token` still holds the cluster lock.
    ///
    /// Returns `None`, leaving the record untouched, when the lock has been
    /// released or taken over by another holder.
    pub fn update_state_as(
        &self,
        cluster_id: &str,
        token: &str,
        update: StateUpdate,
    ) -> StateResult<Option<ClusterState>> {
        let mut held = false;
        let state = self.modify(cluster_id, |state| {
            held = state.lock_holder.as_deref() == Some(token);
            if held {
                state.apply(update);
                state.updated_at = epoch_secs();
            }
            held
        })?;
        if !held {
            warn!(cluster = %cluster_id, %token, holder = ?state.lock_holder, "state write refused, lock not held");
            return Ok(None);
        }
        debug!(
            cluster = %cluster_id,
            node_count = state.node_count,
            history = state.metrics_history.len(),
            "cluster state updated"
        );
        Ok(Some(state))
    }

    /// Run `f` against the cluster record inside one write transaction.
    ///
    /// `f` returns whether to persist the (possibly modified) record. This
    /// is the store's compare-and-set primitive: redb admits one writer at
    /// a time, so nothing can interleave between the read and the write.
    fn modify<F>(&self, cluster_id: &str, f: F) -> StateResult<ClusterState>
    where
        F: FnOnce(&mut ClusterState) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let state = Self::modify_in(&txn, cluster_id, f)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(state)
    }

    fn modify_in<F>(txn: &WriteTransaction, cluster_id: &str, f: F) -> StateResult<ClusterState>
    where
        F: FnOnce(&mut ClusterState) -> bool,
    {
        let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let mut state = match table.get(cluster_id).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice::<ClusterState>(guard.value())
                .map_err(StateError::Decode)?,
            None => ClusterState::new(cluster_id),
        };
        if f(&mut state) {
            let value = serde_json::to_vec(&state).map_err(StateError::Encode)?;
            table
                .insert(cluster_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        Ok(state)
    }

    // ── Distributed lock ───────────────────────────────────────────

    /// Try to take the cluster lock for `token`.
    ///
    /// Succeeds when the record is unlocked. When a lock is held but older
    /// than `ttl`, the stale lock is force-cleared and the acquisition is
    /// retried once. Returns `false` without blocking when a live lock is
    /// held by someone else.
    pub fn acquire_lock(
        &self,
        cluster_id: &str,
        token: &str,
        ttl: Duration,
        now: u64,
    ) -> StateResult<bool> {
        let (holder, acquired_at) = match self.try_lock(cluster_id, token, now)? {
            LockAttempt::Acquired => {
                info!(cluster = %cluster_id, %token, "lock acquired");
                return Ok(true);
            }
            LockAttempt::Held { holder, acquired_at } => (holder, acquired_at),
        };

        let age = acquired_at.map(|at| now.saturating_sub(at));
        let expired = age.is_none_or(|age| age > ttl.as_secs());
        if !expired {
            debug!(cluster = %cluster_id, %holder, ?age, "lock held by another invocation");
            return Ok(false);
        }

        warn!(
            cluster = %cluster_id,
            %holder,
            ?age,
            ttl_secs = ttl.as_secs(),
            "clearing stale lock"
        );
        self.force_clear_stale_lock(cluster_id, &holder, acquired_at)?;

        match self.try_lock(cluster_id, token, now)? {
            LockAttempt::Acquired => {
                info!(cluster = %cluster_id, %token, "lock acquired after stale-lock recovery");
                Ok(true)
            }
            LockAttempt::Held { holder, .. } => {
                debug!(cluster = %cluster_id, %holder, "lost lock race after stale-lock recovery");
                Ok(false)
            }
        }
    }

    /// Conditional write: set the lock fields only if no lock is present.
    fn try_lock(&self, cluster_id: &str, token: &str, now: u64) -> StateResult<LockAttempt> {
        let mut attempt = LockAttempt::Acquired;
        self.modify(cluster_id, |state| match &state.lock_holder {
            Some(holder) => {
                attempt = LockAttempt::Held {
                    holder: holder.clone(),
                    acquired_at: state.lock_acquired_at,
                };
                false
            }
            None => {
                state.lock_holder = Some(token.to_string());
                state.lock_acquired_at = Some(now);
                true
            }
        })?;
        Ok(attempt)
    }

    /// Clear a lock only if it is still the exact lock observed as stale.
    ///
    /// Returns whether the lock was cleared. A concurrent release or
    /// re-acquisition in between leaves the record untouched.
    pub fn force_clear_stale_lock(
        &self,
        cluster_id: &str,
        expected_holder: &str,
        expected_acquired_at: Option<u64>,
    ) -> StateResult<bool> {
        let mut cleared = false;
        self.modify(cluster_id, |state| {
            if state.lock_holder.as_deref() == Some(expected_holder)
                && state.lock_acquired_at == expected_acquired_at
            {
                state.lock_holder = None;
                state.lock_acquired_at = None;
                cleared = true;
            }
            cleared
        })?;
        Ok(cleared)
    }

    /// Unconditionally clear the lock fields. Operator override.
    pub fn release_lock(&self, cluster_id: &str) -> StateResult<()> {
        let mut previous = None;
        self.modify(cluster_id, |state| {
            previous = state.lock_holder.take();
            state.lock_acquired_at = None;
            state.lock_released_at = Some(epoch_secs());
            true
        })?;
        info!(cluster = %cluster_id, holder = ?previous, "lock released");
        Ok(())
    }

    /// Clear the lock only if `token` still holds it. Returns whether it did.
    pub fn release_lock_as(&self, cluster_id: &str, token: &str) -> StateResult<bool> {
        let mut released = false;
        self.modify(cluster_id, |state| {
            if state.lock_holder.as_deref() == Some(token) {
                state.lock_holder = None;
                state.lock_acquired_at = None;
                state.lock_released_at = Some(epoch_secs());
                released = true;
            }
            released
        })?;
        if released {
            info!(cluster = %cluster_id, %token, "lock released");
        } else {
            warn!(cluster = %cluster_id, %token, "lock no longer held, nothing to release");
        }
        Ok(released)
    }

    // ── Metrics archive ────────────────────────────────────────────

    /// Archive a collected snapshot for long-horizon analysis.
    pub fn archive_snapshot(&self, cluster_id: &str, snapshot: &MetricsSnapshot) -> StateResult<()> {
        let key = snapshot.archive_key(cluster_id);
        let value = serde_json::to_vec(snapshot).map_err(StateError::Encode)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(METRICS_ARCHIVE).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Archived snapshots for a cluster with `timestamp >= since`, oldest first.
    pub fn list_archived(&self, cluster_id: &str, since: u64) -> StateResult<Vec<MetricsSnapshot>> {
        let prefix = format!("{cluster_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(METRICS_ARCHIVE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let snapshot: MetricsSnapshot =
                    serde_json::from_slice(value.value()).map_err(StateError::Decode)?;
                if snapshot.timestamp >= since {
                    results.push(snapshot);
                }
            }
        }
        Ok(results)
    }

    /// Delete archived snapshots older than `before`. Returns number deleted.
    pub fn prune_archive(&self, cluster_id: &str, before: u64) -> StateResult<u32> {
        let prefix = format!("{cluster_id}:");
        let cutoff = format!("{cluster_id}:{before:020}");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(METRICS_ARCHIVE).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    (k.starts_with(&prefix) && k < cutoff).then_some(k)
                })
                .collect()
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(METRICS_ARCHIVE).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster = %cluster_id, count, "archived metrics pruned");
        Ok(count)
    }

    // ── Scaling journal ────────────────────────────────────────────

    /// Record an emitted scaling event.
    pub fn record_event(&self, event: &ScalingEvent) -> StateResult<()> {
        let key = event.table_key();
        let value = serde_json::to_vec(event).map_err(StateError::Encode)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Most recent events for a cluster, newest first.
    pub fn list_events(&self, cluster_id: &str, limit: usize) -> StateResult<Vec<ScalingEvent>> {
        let prefix = format!("{cluster_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let event: ScalingEvent =
                    serde_json::from_slice(value.value()).map_err(StateError::Decode)?;
                results.push(event);
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }
}
