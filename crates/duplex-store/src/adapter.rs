//! The store adapter contract.
//!
//! One trait covers both stores. The two non-negotiables:
//!
//! 1. `apply` is idempotent per (workflow key, step index): a pair the
//!    adapter has already applied returns the previously minted reference
//!    without re-executing. This is what makes crash recovery safe — the
//!    coordinator re-issues `apply` for `pending` log entries and adopts
//!    whatever the adapter reports.
//! 2. Every error is classified transient or permanent
//!    ([`duplex_core::errors::StoreError`]); the classification is the sole
//!    input to the coordinator's retry decision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use duplex_core::errors::StoreError;
use duplex_core::ids::{StoreRef, WorkflowKey};
use duplex_core::workflow::{StepAction, StoreKind};

/// One reference as streamed to the reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefRecord {
    /// Cross-store key: the value both stores agree on for a related pair
    /// (a relational row id, or the `primary_ref` field of a document).
    pub cross_key: String,
    /// The store's own reference for the record.
    pub reference: StoreRef,
    /// When the record was created. Feeds the reconciler's grace period.
    pub created_at: DateTime<Utc>,
}

/// Kind of fault to inject into an in-memory store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Connection/timeout class — the coordinator retries these.
    Transient,
    /// Constraint/validation class — triggers compensation immediately.
    Permanent,
}

/// Uniform operation interface over the relational and document stores.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Which store this adapter fronts.
    fn kind(&self) -> StoreKind;

    /// Execute a step action, returning the generated reference.
    ///
    /// Idempotent per (key, `step_index`): a repeated call returns the
    /// recorded reference without a second side effect.
    async fn apply(
        &self,
        key: &WorkflowKey,
        step_index: u32,
        action: &StepAction,
    ) -> Result<StoreRef, StoreError>;

    /// Undo a previously committed step.
    ///
    /// `reference` is the value `apply` returned for the step. Compensations
    /// are already-decided actions; the adapter must not retry internally.
    async fn compensate(
        &self,
        key: &WorkflowKey,
        step_index: u32,
        action: &StepAction,
        reference: &StoreRef,
    ) -> Result<(), StoreError>;

    /// Stream all references in a table/collection, for the reconciler.
    async fn list_refs(&self, target: &str) -> Result<Vec<RefRecord>, StoreError>;

    /// Aggregation-style grouped counts: group records in `target` by the
    /// value of `group_by`, returning `(group value, count)` pairs with
    /// count >= `min_count`.
    async fn grouped_counts(
        &self,
        target: &str,
        group_by: &str,
        min_count: i64,
    ) -> Result<Vec<(String, i64)>, StoreError>;

    /// Number of records in a table/collection.
    async fn count(&self, target: &str) -> Result<i64, StoreError>;
}
