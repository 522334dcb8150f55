//! Drift detection and repair between the two stores.
//!
//! A sweep compares, per configured pair, the relational rows of a primary
//! target against the documents shadowing them, matching on cross key (the
//! row id, carried by documents in their `primary_ref` field). Records
//! younger than the grace period are never flagged as drift — they are
//! usually a workflow that has written one side but not yet the other —
//! though they still count as present when matching the two sides.
//!
//! Drift policy:
//! - missing secondary: auto-heal by submitting the pair's healing workflow
//!   through the coordinator, so the repair itself is logged, retried, and
//!   idempotent like any other workflow
//! - missing primary and stale reference: reported for operator review,
//!   never auto-deleted
//! - unclassified: skipped with a warning
//!
//! A sweep is never fatal: a store read failure skips the pair and the
//! sweep carries on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use duplex_core::ids::{StoreRef, TaskId, WorkflowKey};
use duplex_core::workflow::{WorkflowOutcome, WorkflowRequest};
use duplex_settings::{ReconcilerPair, ReconcilerSettings};
use duplex_store::RefRecord;

use crate::coordinator::Coordinator;
use crate::stores::StorePair;

/// Classification of one detected drift.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Primary row exists, no document carries its cross key.
    MissingSecondary,
    /// A document's cross key matches no primary row.
    MissingPrimary,
    /// A document carries no cross key at all.
    StaleReference,
    /// Multiple documents claim the same cross key; needs a human.
    Unclassified,
}

/// One detected drift, queued for healing or review.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationTask {
    /// Unique task ID.
    pub id: TaskId,
    /// Cross-store key the drift was detected on.
    pub cross_key: String,
    /// Relational table of the pair.
    pub primary_target: String,
    /// Document collection of the pair.
    pub secondary_target: String,
    /// Reference on the primary side, when present.
    pub primary_ref: Option<StoreRef>,
    /// Reference on the secondary side, when present.
    pub secondary_ref: Option<StoreRef>,
    /// Drift classification.
    pub drift: DriftKind,
    /// When the sweep detected it.
    pub detected_at: DateTime<Utc>,
}

/// Outcome of one sweep.
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    /// Every drift detected, including healed ones.
    pub tasks: Vec<ReconciliationTask>,
    /// Keys of healing workflows that completed.
    pub healed: Vec<WorkflowKey>,
    /// Drift flags suppressed because the record was younger than the
    /// grace period.
    pub skipped_recent: usize,
}

/// Periodic reconciler over the configured store pairs.
pub struct Reconciler {
    stores: StorePair,
    coordinator: Arc<Coordinator>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    /// Create a reconciler. Healing goes through the given coordinator.
    #[must_use]
    pub fn new(
        stores: StorePair,
        coordinator: Arc<Coordinator>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            stores,
            coordinator,
            settings,
        }
    }

    /// Run one sweep over every configured pair.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = Utc::now() - Duration::seconds(self.grace_period_secs());

        for pair in &self.settings.pairs {
            self.sweep_pair(pair, cutoff, &mut report).await;
        }

        info!(
            tasks = report.tasks.len(),
            healed = report.healed.len(),
            skipped_recent = report.skipped_recent,
            "sweep complete"
        );
        report
    }

    fn grace_period_secs(&self) -> i64 {
        i64::try_from(self.settings.grace_period_secs).unwrap_or(i64::MAX)
    }

    async fn sweep_pair(
        &self,
        pair: &ReconcilerPair,
        cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let primary = match self.stores.relational.list_refs(&pair.primary_target).await {
            Ok(records) => records,
            Err(err) => {
                warn!(target = %pair.primary_target, error = %err, "primary listing failed, skipping pair");
                return;
            }
        };
        let secondary = match self.stores.document.list_refs(&pair.secondary_target).await {
            Ok(records) => records,
            Err(err) => {
                warn!(target = %pair.secondary_target, error = %err, "secondary listing failed, skipping pair");
                return;
            }
        };

        // Recent records stay in the matching sets: a shadow that arrived
        // moments ago still shields its primary row from MissingSecondary.
        // The grace period only suppresses flagging a record as drift.
        let mut primary_by_key: HashMap<&str, &RefRecord> = HashMap::new();
        for record in &primary {
            let _ = primary_by_key.insert(record.cross_key.as_str(), record);
        }

        let mut secondary_by_key: HashMap<&str, &RefRecord> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for record in &secondary {
            // A cross key equal to the document's own id means the document
            // never carried a primary reference.
            if record.cross_key == record.reference.as_str() {
                if record.created_at > cutoff {
                    report.skipped_recent += 1;
                } else {
                    report.tasks.push(self.task(pair, record.cross_key.clone(), None, Some(record.reference.clone()), DriftKind::StaleReference));
                }
                continue;
            }
            if !seen.insert(record.cross_key.as_str()) {
                if record.created_at > cutoff {
                    report.skipped_recent += 1;
                } else {
                    warn!(cross_key = %record.cross_key, collection = %pair.secondary_target, "duplicate shadow document");
                    report.tasks.push(self.task(pair, record.cross_key.clone(), None, Some(record.reference.clone()), DriftKind::Unclassified));
                }
                continue;
            }
            let _ = secondary_by_key.insert(record.cross_key.as_str(), record);
        }

        // Primary rows without a shadow: heal, unless the row is recent.
        for (cross_key, record) in &primary_by_key {
            if secondary_by_key.contains_key(cross_key) {
                continue;
            }
            if record.created_at > cutoff {
                report.skipped_recent += 1;
                continue;
            }
            report.tasks.push(self.task(
                pair,
                (*cross_key).to_owned(),
                Some(record.reference.clone()),
                None,
                DriftKind::MissingSecondary,
            ));
            self.heal(pair, cross_key, report).await;
        }

        // Shadows without a primary row: report only, unless recent.
        for (cross_key, record) in &secondary_by_key {
            if primary_by_key.contains_key(cross_key) {
                continue;
            }
            if record.created_at > cutoff {
                report.skipped_recent += 1;
                continue;
            }
            report.tasks.push(self.task(
                pair,
                (*cross_key).to_owned(),
                None,
                Some(record.reference.clone()),
                DriftKind::MissingPrimary,
            ));
        }
    }

    /// Submit the pair's healing workflow for one missing shadow.
    ///
    /// The workflow key is derived from the pair and cross key, so repeated
    /// sweeps of the same drift reuse one workflow instead of stacking
    /// duplicate repairs.
    async fn heal(&self, pair: &ReconcilerPair, cross_key: &str, report: &mut SweepReport) {
        let key = WorkflowKey::from(format!(
            "reconcile/{}/{cross_key}",
            pair.secondary_target
        ));
        let request = WorkflowRequest {
            key: key.clone(),
            workflow: pair.heal_workflow.clone(),
            params: json!({
                "collection": pair.secondary_target,
                "primary_ref": cross_key,
            }),
        };
        match self.coordinator.submit(request).await {
            Ok(WorkflowOutcome::Completed { .. }) => {
                info!(%key, cross_key, "healed missing shadow");
                report.healed.push(key);
            }
            Ok(WorkflowOutcome::AlreadyRunning) => {
                info!(%key, "healing already in flight");
            }
            Ok(WorkflowOutcome::Failed { reason, .. }) => {
                warn!(%key, reason, "healing workflow failed");
            }
            Err(err) => {
                warn!(%key, error = %err, "healing submission errored");
            }
        }
    }

    fn task(
        &self,
        pair: &ReconcilerPair,
        cross_key: String,
        primary_ref: Option<StoreRef>,
        secondary_ref: Option<StoreRef>,
        drift: DriftKind,
    ) -> ReconciliationTask {
        ReconciliationTask {
            id: TaskId::new(),
            cross_key,
            primary_target: pair.primary_target.clone(),
            secondary_target: pair.secondary_target.clone(),
            primary_ref,
            secondary_ref,
            drift,
            detected_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
