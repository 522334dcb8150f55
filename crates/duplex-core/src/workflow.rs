//! Workflow vocabulary — the typed shapes a cross-store workflow is built from.
//!
//! A caller submits a [`WorkflowRequest`] naming a workflow and carrying an
//! idempotency key. The engine resolves the name to an ordered list of
//! [`Step`]s; each step is one atomic action against exactly one store, with
//! a compensation to run if a later step fails. Every step execution leaves
//! an immutable [`OpLogEntry`] behind — the operation log is the durable,
//! queryable record of the whole attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::ids::{EntryId, StoreRef, WorkflowKey};

// ─────────────────────────────────────────────────────────────────────────────
// Stores and steps
// ─────────────────────────────────────────────────────────────────────────────

/// Which of the two stores a step targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// The relational store (rows, generated integer keys).
    Relational,
    /// The document store (JSON documents, generated identifiers).
    Document,
}

impl StoreKind {
    /// Stable string form, used in the operation log.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Document => "document",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relational" => Some(Self::Relational),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutation class of a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Insert a new row or document.
    Create,
    /// Update existing rows/documents (including upsert-by-filter).
    Update,
    /// Delete rows/documents.
    Delete,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One atomic action against exactly one store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepAction {
    /// Target store.
    pub store: StoreKind,
    /// Mutation class.
    pub kind: StepKind,
    /// Table or collection name.
    pub target: String,
    /// Store-specific payload (fields, filter, aggregation spec).
    pub payload: Value,
}

/// The inverse action to run when a later step fails.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "action")]
pub enum Compensation {
    /// No inverse. Safe only for appends the adapter suppresses on replay.
    None,
    /// Explicit inverse operation. The recorded [`StoreRef`] of the committed
    /// step is made available to the adapter alongside this action.
    Inverse(StepAction),
}

/// One step of a workflow: an action plus its compensation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// The forward action.
    pub action: StepAction,
    /// What to do if a later step fails.
    pub compensation: Compensation,
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests and outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// A caller's request to run a named workflow once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Caller-supplied idempotency key, unique per logical attempt.
    pub key: WorkflowKey,
    /// Name of the workflow in the catalog.
    pub workflow: String,
    /// Workflow parameters.
    pub params: Value,
}

/// Terminal or rejection outcome of a submission.
///
/// `submit` always returns one of these; a caller is never left unable to
/// determine workflow status.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum WorkflowOutcome {
    /// Every step committed. `refs` holds the per-step store references in
    /// step order.
    Completed {
        /// Generated references, one per step.
        refs: Vec<StoreRef>,
    },
    /// The workflow failed irrecoverably. The partial log lets an operator
    /// see exactly which steps committed, compensated, or failed.
    Failed {
        /// Why the workflow failed.
        reason: String,
        /// Operation log entries for this key, in order.
        partial_log: Vec<OpLogEntry>,
    },
    /// An execution for this key is already in flight.
    AlreadyRunning,
}

// ─────────────────────────────────────────────────────────────────────────────
// Operation log entries
// ─────────────────────────────────────────────────────────────────────────────

/// Status of an operation log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Intent logged, adapter call not yet resolved.
    Pending,
    /// Adapter call succeeded; reference recorded.
    Committed,
    /// Previously committed step was undone.
    Compensated,
    /// Adapter call failed permanently (or exhausted retries).
    Failed,
}

impl EntryStatus {
    /// Stable string form, used in the operation log schema.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            "compensated" => Some(Self::Compensated),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one cross-store intent or its resolution.
///
/// Entries are append-only: a status change is a new row with a fresh
/// [`EntryId`], never an in-place update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpLogEntry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Idempotency key of the owning workflow attempt.
    pub key: WorkflowKey,
    /// Zero-based step index within the workflow.
    pub step_index: u32,
    /// Store the step targets.
    pub store: StoreKind,
    /// Entry status.
    pub status: EntryStatus,
    /// Generated reference, present once committed.
    pub reference: Option<StoreRef>,
    /// Free-form detail (error message, compensation note).
    pub detail: Option<String>,
    /// When the entry was appended.
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
