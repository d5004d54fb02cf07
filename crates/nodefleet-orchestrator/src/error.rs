//! Orchestrator error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("state store error: {0}")]
    State(#[from] nodefleet_state::StateError),

    #[error("metrics error: {0}")]
    Metrics(#[from] nodefleet_metrics::MetricsError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] nodefleet_lifecycle::LifecycleError),

    /// The lock was cleared or taken over before the cycle wrote its state.
    #[error("cluster lock lost before state write")]
    LockLost,
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
