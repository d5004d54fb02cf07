//! State store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// A failed state store operation. redb errors are flattened to strings;
/// JSON codec errors keep their source.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("state table unavailable: {0}")]
    Table(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("state write failed: {0}")]
    Write(String),

    #[error("failed to encode state record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("corrupt state record: {0}")]
    Decode(#[source] serde_json::Error),
}
