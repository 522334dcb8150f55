//! Error hierarchy for the Duplex sync core.
//!
//! Provides a structured error type system built on [`thiserror`]:
//!
//! - [`StoreError`]: adapter-level failures, split into transient
//!   (connection/timeout — retry-eligible) and permanent (constraint or
//!   malformed payload — never retried)
//! - [`DuplexError`]: top-level enum covering all error domains, including
//!   compensation failures and concurrent-execution conflicts
//!
//! The transient/permanent classification is the single input to every retry
//! decision in the coordinator: [`DuplexError::is_transient`] is consulted
//! after each failed adapter call.

use thiserror::Error;

use crate::workflow::StoreKind;

// ─────────────────────────────────────────────────────────────────────────────
// StoreError — adapter-level failures
// ─────────────────────────────────────────────────────────────────────────────

/// Error returned by a store adapter.
///
/// Adapters must classify every failure: `Transient` failures are eligible
/// for bounded retry with backoff, `Permanent` failures trigger compensation
/// immediately.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Infrastructure-level failure (connection refused, timeout). Retryable.
    #[error("transient {store} store error: {message}")]
    Transient {
        /// Store that failed.
        store: StoreKind,
        /// Human-readable message.
        message: String,
    },

    /// Data-level failure (constraint violation, malformed payload). Not retried.
    #[error("permanent {store} store error: {message}")]
    Permanent {
        /// Store that failed.
        store: StoreKind,
        /// Human-readable message.
        message: String,
    },
}

impl StoreError {
    /// Build a transient error.
    #[must_use]
    pub fn transient(store: StoreKind, message: impl Into<String>) -> Self {
        Self::Transient {
            store,
            message: message.into(),
        }
    }

    /// Build a permanent error.
    #[must_use]
    pub fn permanent(store: StoreKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            store,
            message: message.into(),
        }
    }

    /// Whether this error is retry-eligible.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The store that produced this error.
    #[must_use]
    pub fn store(&self) -> StoreKind {
        match self {
            Self::Transient { store, .. } | Self::Permanent { store, .. } => *store,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DuplexError — top-level error enum
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level error type for the Duplex sync core.
#[derive(Debug, Error)]
pub enum DuplexError {
    /// Store adapter failure (transient or permanent).
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A compensation action itself failed. Fatal for the workflow instance;
    /// never retried automatically (risk of double-compensation).
    #[error("compensation failed for key {key} at step {failed_step}: {message}")]
    Compensation {
        /// Idempotency key of the workflow.
        key: String,
        /// Step index whose compensation failed.
        failed_step: u32,
        /// Step indices that were successfully unwound before the failure.
        unwound: Vec<u32>,
        /// Human-readable message.
        message: String,
    },

    /// An execution is already in flight for this idempotency key.
    #[error("workflow already running for key {key}")]
    ConcurrentExecution {
        /// Idempotency key of the conflicting submission.
        key: String,
    },

    /// The request named a workflow the catalog does not define.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The request's params are missing or malformed for the named workflow.
    #[error("invalid workflow params: {0}")]
    InvalidParams(String),

    /// Operation log failure. The log is on the critical path (durability
    /// before progress), so this aborts the step loop.
    #[error("operation log error: {0}")]
    Log(String),

    /// Internal error (e.g. poisoned state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl DuplexError {
    /// Whether the coordinator may retry the failed operation.
    ///
    /// Only transient store errors qualify; everything else either
    /// compensates or fails the workflow outright.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

/// Convenience type alias for Duplex results.
pub type Result<T> = std::result::Result<T, DuplexError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
