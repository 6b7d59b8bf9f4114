//! Ledger error types

use qms_shared::TimestampError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("No active rate: {0}")]
    NoActiveRate(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-checkable classification of a [`LedgerError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    NoActiveRate,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::InvalidInput => write!(f, "invalid_input"),
            ErrorKind::NoActiveRate => write!(f, "no_active_rate"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::NotFound(_) | LedgerError::UnknownResource(_) => ErrorKind::NotFound,
            LedgerError::Conflict(_) => ErrorKind::Conflict,
            LedgerError::InvalidInput(_)
            | LedgerError::InvalidAmount(_)
            | LedgerError::InvalidOperation(_)
            | LedgerError::InvalidPeriod(_) => ErrorKind::InvalidInput,
            LedgerError::NoActiveRate(_) => ErrorKind::NoActiveRate,
            LedgerError::Database(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation() =>
            {
                ErrorKind::Conflict
            }
            LedgerError::Database(_) | LedgerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Translate a unique-constraint violation into `Conflict`, passing other errors through.
    pub(crate) fn conflict_on_unique(err: sqlx::Error, message: impl FnOnce() -> String) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                LedgerError::Conflict(message())
            }
            _ => LedgerError::Database(err),
        }
    }
}

impl From<TimestampError> for LedgerError {
    fn from(err: TimestampError) -> Self {
        LedgerError::InvalidInput(err.to_string())
    }
}
