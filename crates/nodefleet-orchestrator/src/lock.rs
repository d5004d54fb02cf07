//! Scoped ownership of the cluster lock.

use std::time::Duration;

use tracing::error;

use nodefleet_state::{StateResult, StateStore};

/// Holds the cluster lock until released.
///
/// Call [`LockGuard::release`] at the end of the cycle. A guard dropped
/// without release (early return, panic unwinding) releases on drop and
/// logs any failure.
pub struct LockGuard {
    store: StateStore,
    cluster_id: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Try to take the lock. `Ok(None)` means a live lock is held elsewhere.
    pub fn acquire(
        store: &StateStore,
        cluster_id: &str,
        token: &str,
        ttl: Duration,
        now: u64,
    ) -> StateResult<Option<Self>> {
        if !store.acquire_lock(cluster_id, token, ttl, now)? {
            return Ok(None);
        }
        Ok(Some(Self {
            store: store.clone(),
            cluster_id: cluster_id.to_string(),
            token: token.to_string(),
            released: false,
        }))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock if this guard still holds it. `Ok(false)` means
    /// it was already cleared or taken over by another invocation.
    pub fn release(mut self) -> StateResult<bool> {
        self.released = true;
        self.store.release_lock_as(&self.cluster_id, &self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.release_lock_as(&self.cluster_id, &self.token) {
            error!(cluster = %self.cluster_id, token = %self.token, error = %e, "failed to release lock on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let store = StateStore::open_in_memory().unwrap();
        let guard = LockGuard::acquire(&store, "c1", "a", TTL, 100).unwrap().unwrap();
        assert!(LockGuard::acquire(&store, "c1", "b", TTL, 101).unwrap().is_none());

        assert!(guard.release().unwrap());
        assert!(LockGuard::acquire(&store, "c1", "b", TTL, 102).unwrap().is_some());
    }

    #[test]
    fn guard_does_not_release_a_lock_taken_over() {
        let store = StateStore::open_in_memory().unwrap();
        let stale = LockGuard::acquire(&store, "c1", "a", TTL, 100).unwrap().unwrap();
        let fresh = LockGuard::acquire(&store, "c1", "b", TTL, 401).unwrap().unwrap();
        assert_eq!(fresh.token(), "b");

        assert!(!stale.release().unwrap());
        assert_eq!(store.read_state("c1").unwrap().lock_holder.as_deref(), Some("b"));

        drop(fresh);
        assert!(!store.read_state("c1").unwrap().is_locked());
    }

    #[test]
    fn dropped_guard_releases() {
        let store = StateStore::open_in_memory().unwrap();
        {
            let _guard = LockGuard::acquire(&store, "c1", "a", TTL, 100).unwrap().unwrap();
            assert!(store.read_state("c1").unwrap().is_locked());
        }
        let state = store.read_state("c1").unwrap();
        assert!(!state.is_locked());
        assert!(state.lock_released_at.is_some());
    }

    #[test]
    fn panicking_holder_still_releases() {
        let store = StateStore::open_in_memory().unwrap();
        let cloned = store.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = LockGuard::acquire(&cloned, "c1", "a", TTL, 100).unwrap().unwrap();
            panic!("cycle blew up");
        }));
        assert!(result.is_err());
        assert!(!store.read_state("c1").unwrap().is_locked());
    }
}
