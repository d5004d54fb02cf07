//! nodefleet-orchestrator — the per-invocation scaling cycle.
//!
//! [`Orchestrator::run_cycle`] is a plain async function of `now`. Whatever
//! drives it (the `nodefleetd` interval loop, cron, a test) supplies the
//! tick; the cycle itself never schedules anything.
//!
//! # Cycle
//!
//! ```text
//! Start → AcquireLock ──held──→ exit (silent)
//!           │
//!           ▼
//!      CollectMetrics ──failed, no fresh cache──→ release → exit
//!           │
//!           ▼
//!       LoadState ──spot interruption notices──→ drain + replace → UpdateState → release
//!           │
//!           ▼
//!     CheckCooldown ──blocked──→ release → exit
//!           │
//!           ▼
//!        Decide → Execute (if action) → UpdateState → ReleaseLock → Notify → End
//! ```
//!
//! The lock is held through a [`LockGuard`]; it is released explicitly on
//! every path and, failing that, when the guard is dropped. Work under the
//! lock is cut off at nine tenths of the lock TTL, and every state write
//! checks that this invocation still holds the lock.

pub mod activity;
pub mod cycle;
pub mod error;
pub mod lock;
pub mod notify;

pub use activity::{ActivityLevel, assess_activity, next_interval};
pub use cycle::{CycleOutcome, CyclePhase, CycleResult, Orchestrator, OrchestratorSettings};
pub use error::{OrchestratorError, OrchestratorResult};
pub use lock::LockGuard;
pub use notify::{LogSink, NotificationSink, NotifyError, RecordingSink, WebhookSink};
