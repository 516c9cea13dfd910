//! Metadata Error Types
//!
//! This module defines all error types that can occur while reading or
//! writing the shared coordination tables.
//!
//! ## Error Categories
//!
//! ### Database Errors
//! - `DatabaseError`: SQLite/PostgreSQL operation failed (connection, query, etc.)
//! - `MigrationError`: Schema migration failed at startup
//!
//! ### Data Errors
//! - `InvalidRow`: A stored row holds a value this version cannot interpret
//! - `InvalidAgent`: An agent row about to be written violates a table invariant
//!
//! ## Transient vs Permanent
//!
//! Callers running a polling loop retry every error at the next iteration.
//! [`MetadataError::is_transient`] only tells them whether the failure looks
//! like a connectivity/contention blip (log at `warn`) or something that will
//! keep failing (log at `error`).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Invalid agent: {0}")]
    InvalidAgent(String),
}

impl From<sqlx::migrate::MigrateError> for MetadataError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        MetadataError::MigrationError(e.to_string())
    }
}

impl MetadataError {
    /// Connection loss, pool exhaustion, lock contention or serialization
    /// failures; retrying later is expected to succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::DatabaseError(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => matches!(
                    db.code().as_deref(),
                    // SQLITE_BUSY, SQLITE_LOCKED, serialization_failure, deadlock_detected
                    Some("5") | Some("6") | Some("40001") | Some("40P01")
                ),
                _ => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(MetadataError::DatabaseError(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_data_errors_are_permanent() {
        assert!(!MetadataError::InvalidRow("state = BOGUS".to_string()).is_transient());
        assert!(!MetadataError::DatabaseError(sqlx::Error::RowNotFound).is_transient());
    }
}
