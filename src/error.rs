use thiserror::Error;

use crate::models::{EventId, LeaseOwner};

/// Failures raised by a ledger backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Another transaction committed a conflicting write first.
    #[error("transaction conflict")]
    Conflict,

    #[error("cache error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("corrupt ledger data: {0}")]
    Corrupt(String),
}

// Postgres SQLSTATEs that mean "lost a race", not "storage is broken".
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if matches!(db_err.code().as_deref(), Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED)) {
                return StoreError::Conflict;
            }
        }
        StoreError::Database(err)
    }
}

/// Outcome taxonomy of lease and catalog operations.
///
/// `SeatUnavailable` and `InsufficientAvailability` are normal results under
/// contention; callers may retry with a different seat selection.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("event {0} not found")]
    NotFound(EventId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("seats {} are not available", .labels.join(", "))]
    SeatUnavailable { labels: Vec<String> },

    #[error("only {available} seats available, {requested} requested")]
    InsufficientAvailability { requested: u64, available: i64 },

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseOwner),

    #[error("internal error: {0}")]
    Internal(#[from] StoreError),
}

impl LeaseError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        LeaseError::InvalidRequest(msg.into())
    }

    /// Expected outcomes under contention, as opposed to faults.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            LeaseError::SeatUnavailable { .. } | LeaseError::InsufficientAvailability { .. }
        )
    }
}

impl From<sqlx::Error> for LeaseError {
    fn from(err: sqlx::Error) -> Self {
        LeaseError::Internal(err.into())
    }
}

pub type LeaseResult<T> = Result<T, LeaseError>;
