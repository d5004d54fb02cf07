//! nodefleet-state — the coordination and state layer for NodeFleet.
//!
//! Backed by [redb](https://docs.rs/redb). Holds exactly one
//! [`ClusterState`] record per managed cluster plus two append-only
//! tables: an archive of collected metrics (for the predictive layer) and
//! a journal of emitted scaling events.
//!
//! # Coordination
//!
//! redb serializes write transactions, so a read-check-write performed
//! inside a single write transaction is an atomic conditional write. The
//! distributed lock (`acquire_lock` / `release_lock`) is built on that:
//!
//! ```text
//! acquire_lock(cluster, token, ttl, now)
//!   ├── unlocked              → set holder + acquired_at → true
//!   ├── held, age <= ttl      → false (caller exits, no retry)
//!   └── held, age >  ttl      → force-clear stale lock, retry once
//! ```
//!
//! `update_state_as` and `release_lock_as` repeat the holder check inside
//! their write, so an invocation whose lock was recovered as stale cannot
//! touch the record afterwards.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! so concurrent invocations can share one handle.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
