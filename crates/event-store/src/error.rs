use std::sync::Arc;

use thiserror::Error;

use common::AggregateId;

/// Errors that can occur when interacting with the aggregate event store.
///
/// Non-clonable sources are held behind `Arc` so a store error can be both
/// recorded on an execution context and returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Another writer claimed the same `(aggregate_id, ordinal)` slot first.
    /// An expected outcome under concurrent writers; callers decide whether
    /// to retry the whole command.
    #[error(
        "optimistic lock violation for aggregate {aggregate_id}: ordinal {ordinal:?} already taken"
    )]
    LockViolation {
        aggregate_id: AggregateId,
        ordinal: Option<i64>,
        #[source]
        source: Option<Arc<sqlx::Error>>,
    },

    /// The batch handed to `commit_all_events` is malformed.
    #[error("invalid event batch: {0}")]
    InvalidBatch(String),

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[source] Arc<sqlx::Error>),

    /// A database migration error occurred.
    #[error("migration error: {0}")]
    Migration(#[source] Arc<sqlx::migrate::MigrateError>),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),
}

impl StoreError {
    /// True when this error is the expected concurrent-writer conflict
    /// rather than an infrastructure failure.
    pub fn is_lock_violation(&self) -> bool {
        matches!(self, StoreError::LockViolation { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(Arc::new(e))
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(Arc::new(e))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(Arc::new(e))
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
