//! Error types for the operation log subsystem.
//!
//! [`OpLogError`] is the primary error type returned by all log operations.
//! Log failures always abort the workflow that triggered them, so the
//! conversion into [`DuplexError`] collapses the variants into the single
//! `Log` case the engine reports.

use duplex_core::errors::DuplexError;
use thiserror::Error;

/// Errors that can occur during operation log access.
#[derive(Debug, Error)]
pub enum OpLogError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// A stored row could not be decoded into a log entry.
    #[error("corrupt entry: {0}")]
    CorruptEntry(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for operation log results.
pub type Result<T> = std::result::Result<T, OpLogError>;

impl From<OpLogError> for DuplexError {
    fn from(err: OpLogError) -> Self {
        DuplexError::Log(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
