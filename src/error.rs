//! Error types for order execution and storage

use rust_decimal::Decimal;
use thiserror::Error;

/// Failures surfaced by the storage layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// A version check or uniqueness check rejected the write.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            // 23505 = unique_violation
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed failures returned to the caller of the execution engine
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("insufficient balance: order costs {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("insufficient holdings: requested {requested}, held {held}")]
    InsufficientHoldings { requested: Decimal, held: Decimal },

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl ExecutionError {
    /// Stable machine-readable code, used for metric labels and replies.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::InvalidOrder(_) => "invalid_order",
            ExecutionError::AccountNotFound(_) => "account_not_found",
            ExecutionError::InsufficientBalance { .. } => "insufficient_balance",
            ExecutionError::InsufficientHoldings { .. } => "insufficient_holdings",
            ExecutionError::ConcurrencyConflict(_) => "concurrency_conflict",
            ExecutionError::StorageFailure(_) => "storage_failure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::ConcurrencyConflict(_))
    }
}

impl From<StoreError> for ExecutionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ExecutionError::ConcurrencyConflict(msg),
            other => ExecutionError::StorageFailure(other.to_string()),
        }
    }
}
