//! Queue error taxonomy.
//!
//! Validation variants are always raised before the collection is touched.
//! Store failures are wrapped unchanged in [`QueueError::Store`].

use thiserror::Error;

use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid filter key {0:?}: keys must be non-empty payload field names, top-level operators are not allowed")]
    InvalidFilterKey(String),

    #[error("invalid index field {0:?}")]
    InvalidIndexField(String),

    #[error("invalid direction {direction} for field {field:?} (expected 1 or -1)")]
    InvalidDirection { field: String, direction: i64 },

    #[error("index key pattern is empty")]
    EmptyIndex,

    #[error("priority must be a finite number, got {0}")]
    InvalidPriority(f64),

    #[error("limit must be at least 1")]
    InvalidLimit,

    #[error("could not create index {keys} after {attempts} attempts")]
    IndexCreationExhausted { keys: String, attempts: u32 },

    #[error("malformed queue document: {0}")]
    MalformedDocument(String),

    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("cannot read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Validation failures are the caller's fault and never reach the store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidFilterKey(_)
                | QueueError::InvalidIndexField(_)
                | QueueError::InvalidDirection { .. }
                | QueueError::EmptyIndex
                | QueueError::InvalidPriority(_)
                | QueueError::InvalidLimit
        )
    }
}
