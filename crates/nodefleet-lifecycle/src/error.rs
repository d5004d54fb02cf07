//! Lifecycle error types.

use thiserror::Error;

use crate::types::LifecycleClass;

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("no {class} capacity in {zone}")]
    CapacityRejected { class: LifecycleClass, zone: String },

    #[error("provider throttled: {0}")]
    Throttled(String),

    #[error("provider API error: {0}")]
    Api(String),

    #[error("instance not found: {0}")]
    NotFound(String),
}

impl LifecycleError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LifecycleError::Throttled(_))
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
