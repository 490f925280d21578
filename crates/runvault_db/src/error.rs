//! Error types for the metadata layer.

use runvault_protocol::ErrorCode;
use thiserror::Error;

/// Database operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLite error (open, query, constraint raised by the engine)
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation detected before hitting the engine
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Stored value that does not parse back into its domain type
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema bootstrap could not take the single-flight lock
    #[error("Lock error: {0}")]
    Lock(#[from] crate::lock::LockError),
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a constraint error.
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Metadata failures during a pipeline run are storage failures.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::StorageError
    }
}
