//! Error types for the errand state store.

use thiserror::Error;

use crate::types::TaskState;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource pool `{pool}' cannot grow by {requested}: {size}/{max_size} in use")]
    CapacityExceeded {
        pool: String,
        requested: u32,
        size: u32,
        max_size: u32,
    },

    #[error("task `{task_id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },
}
