//! Metrics collection errors.

use thiserror::Error;

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Coarse classification of a metrics failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsErrorKind {
    /// The service could not be reached or kept failing after retries.
    Unavailable,
    /// A single attempt exceeded its timeout.
    Timeout,
    /// The service answered with something that is not a usable sample.
    Malformed,
}

/// A failed metrics query.
#[derive(Debug, Clone, Error)]
#[error("metrics {kind:?} for {query}: {message}")]
pub struct MetricsError {
    pub kind: MetricsErrorKind,
    /// Signal name or expression the failure belongs to.
    pub query: String,
    pub message: String,
}

impl MetricsError {
    pub fn new(kind: MetricsErrorKind, query: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            query: query.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(MetricsErrorKind::Unavailable, query, message)
    }

    pub fn malformed(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(MetricsErrorKind::Malformed, query, message)
    }
}
