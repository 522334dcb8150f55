//! Synchronization coordinator.
//!
//! Drives one workflow at a time per idempotency key through the
//! write-ahead step loop:
//!
//! 1. admission — at most one in-flight execution per key, enforced with a
//!    [`DashMap`] entry; terminal outcomes replay from cache or log
//! 2. per step: append `pending`, call the adapter with bounded retries for
//!    transient failures, append `committed` (or `failed`)
//! 3. on failure: unwind committed steps in reverse order, appending a
//!    `compensated` row per undone step
//!
//! Every durability write precedes the store write it describes, so a crash
//! at any point leaves a log from which [`Coordinator::recover`] can replay.
//! Replay leans on adapter idempotency: a committed step is adopted from the
//! log without touching the store, and a pending step is re-applied safely.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use duplex_core::errors::{DuplexError, Result, StoreError};
use duplex_core::ids::{StoreRef, WorkflowKey};
use duplex_core::retry::{backoff_delay_with_random, RetryConfig};
use duplex_core::workflow::{
    Compensation, EntryStatus, OpLogEntry, Step, StepAction, WorkflowOutcome, WorkflowRequest,
};
use duplex_oplog::OperationLog;

use crate::catalog::WorkflowCatalog;
use crate::stores::StorePair;

/// Derived status of a workflow key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// An execution is in flight right now.
    Running,
    /// Every logged step resolved to committed.
    Completed,
    /// A step failed or was compensated; the workflow will not be retried.
    Failed,
    /// A pending step never resolved — the process died mid-step.
    Interrupted,
}

/// Cross-store workflow coordinator.
pub struct Coordinator {
    log: Arc<OperationLog>,
    stores: StorePair,
    retry: RetryConfig,
    running: DashMap<String, ()>,
    cancel_requested: DashMap<String, ()>,
    // Terminal outcomes by key. A cache only — the log remains the durable
    // source of truth across restarts.
    outcomes: DashMap<String, WorkflowOutcome>,
}

impl Coordinator {
    /// Create a coordinator with the default retry policy.
    #[must_use]
    pub fn new(log: Arc<OperationLog>, stores: StorePair) -> Self {
        Self {
            log,
            stores,
            retry: RetryConfig::default(),
            running: DashMap::new(),
            cancel_requested: DashMap::new(),
            outcomes: DashMap::new(),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run a workflow to a terminal outcome.
    ///
    /// Submitting a key whose workflow already reached a terminal outcome
    /// replays that outcome without new store writes. Submitting a key that
    /// is currently executing returns [`WorkflowOutcome::AlreadyRunning`].
    ///
    /// # Errors
    ///
    /// Catalog and operation log failures surface as errors. A failed
    /// compensation surfaces as [`DuplexError::Compensation`]; step failures
    /// themselves are a normal [`WorkflowOutcome::Failed`], not an error.
    pub async fn submit(&self, request: WorkflowRequest) -> Result<WorkflowOutcome> {
        if let Some(outcome) = self.outcomes.get(request.key.as_str()) {
            debug!(key = %request.key, "replaying cached terminal outcome");
            return Ok(outcome.clone());
        }

        if let Err(err) = self.admit(&request.key) {
            return match err {
                DuplexError::ConcurrentExecution { .. } => Ok(WorkflowOutcome::AlreadyRunning),
                other => Err(other),
            };
        }

        let result = self.execute(&request).await;
        let _ = self.running.remove(request.key.as_str());
        let _ = self.cancel_requested.remove(request.key.as_str());

        if let Ok(outcome) = &result {
            if cacheable_outcome(outcome) {
                let _ = self
                    .outcomes
                    .insert(request.key.as_str().to_owned(), outcome.clone());
            }
        }
        result
    }

    /// Request cancellation of an in-flight execution.
    ///
    /// Observed at the next step boundary: the running step completes, then
    /// committed steps are compensated and the workflow fails. Returns
    /// whether an execution was in flight.
    pub fn cancel(&self, key: &WorkflowKey) -> bool {
        if self.running.contains_key(key.as_str()) {
            let _ = self.cancel_requested.insert(key.as_str().to_owned(), ());
            info!(%key, "cancellation requested");
            true
        } else {
            false
        }
    }

    /// Derive the status of a workflow key from the running set and the log.
    pub fn status(&self, key: &WorkflowKey) -> Result<Option<WorkflowStatus>> {
        if self.running.contains_key(key.as_str()) {
            return Ok(Some(WorkflowStatus::Running));
        }
        let entries = self.log.list_by_key(key)?;
        if entries.is_empty() {
            return Ok(None);
        }
        if entries
            .iter()
            .any(|e| matches!(e.status, EntryStatus::Failed | EntryStatus::Compensated))
        {
            return Ok(Some(WorkflowStatus::Failed));
        }
        // Last row per step wins; rows are in append order.
        let mut latest = std::collections::BTreeMap::new();
        for entry in &entries {
            let _ = latest.insert(entry.step_index, entry.status);
        }
        if latest.values().any(|s| *s == EntryStatus::Pending) {
            Ok(Some(WorkflowStatus::Interrupted))
        } else {
            Ok(Some(WorkflowStatus::Completed))
        }
    }

    /// Full operation log history for a key, in append order.
    pub fn history(&self, key: &WorkflowKey) -> Result<Vec<OpLogEntry>> {
        Ok(self.log.list_by_key(key)?)
    }

    /// Replay every workflow the log shows as interrupted.
    ///
    /// Called once at startup. Committed steps are adopted from the log;
    /// the step that was in flight when the process died is re-applied (the
    /// adapter suppresses the side effect if it already landed). A crash
    /// during an unwind is recovered too: keys with a failed row and
    /// committed steps that never got their `compensated` row resume the
    /// unwind where it stopped.
    pub async fn recover(&self) -> Result<Vec<(WorkflowKey, WorkflowOutcome)>> {
        let keys = self.log.pending_keys()?;
        let mut replayed = Vec::with_capacity(keys.len());
        for key in keys {
            if self.running.contains_key(key.as_str()) {
                continue;
            }
            let Some(request) = self.log.get_request(&key)? else {
                warn!(%key, "pending entries with no recorded request, skipping");
                continue;
            };
            info!(%key, workflow = %request.workflow, "recovering interrupted workflow");
            let outcome = self.submit(request).await?;
            replayed.push((key, outcome));
        }

        for key in self.log.compensation_pending_keys()? {
            if self.running.contains_key(key.as_str()) {
                continue;
            }
            let Some(request) = self.log.get_request(&key)? else {
                warn!(%key, "unfinished compensation with no recorded request, skipping");
                continue;
            };
            info!(%key, workflow = %request.workflow, "resuming interrupted compensation");
            self.resume_unwind(&request).await?;
            let history = self.log.list_by_key(&key)?;
            let reason = terminal_failure_reason(&history)
                .unwrap_or_else(|| "previous attempt failed".to_string());
            replayed.push((
                key,
                WorkflowOutcome::Failed {
                    reason,
                    partial_log: history,
                },
            ));
        }
        Ok(replayed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal
    // ─────────────────────────────────────────────────────────────────────────

    fn admit(&self, key: &WorkflowKey) -> Result<()> {
        match self.running.entry(key.as_str().to_owned()) {
            Entry::Occupied(_) => Err(DuplexError::ConcurrentExecution {
                key: key.as_str().to_owned(),
            }),
            Entry::Vacant(slot) => {
                let _ = slot.insert(());
                Ok(())
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn execute(&self, request: &WorkflowRequest) -> Result<WorkflowOutcome> {
        let key = &request.key;

        let history = self.log.list_by_key(key)?;
        if let Some(reason) = terminal_failure_reason(&history) {
            debug!(%key, "replaying failed outcome from log");
            return Ok(WorkflowOutcome::Failed {
                reason,
                partial_log: history,
            });
        }

        // A key the log shows as Completed answers from its recorded refs.
        // Re-resolving the workflow here would re-derive steps from current
        // store state and could execute indexes the first run never had.
        if let Some(step_count) = self.log.completed_step_count(key)? {
            debug!(%key, step_count, "replaying completed outcome from log");
            return Ok(WorkflowOutcome::Completed {
                refs: self.committed_refs(key, step_count)?,
            });
        }

        self.log.record_request(request)?;
        let steps = WorkflowCatalog::resolve(request, &self.stores).await?;
        info!(%key, workflow = %request.workflow, steps = steps.len(), "workflow accepted");

        let mut refs: Vec<StoreRef> = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let step_index = index as u32;

            if self.cancel_requested.remove(key.as_str()).is_some() {
                info!(%key, step_index, "cancellation observed at step boundary");
                self.unwind(key, &steps, &refs).await?;
                return Ok(WorkflowOutcome::Failed {
                    reason: "cancelled at step boundary".to_string(),
                    partial_log: self.log.list_by_key(key)?,
                });
            }

            // Replay: a committed step is adopted from the log, the store is
            // not touched again.
            if let Some(committed) = self.log.committed_for_step(key, step_index)? {
                let reference = committed.reference.ok_or_else(|| {
                    DuplexError::Internal(format!(
                        "committed entry for step {step_index} has no reference"
                    ))
                })?;
                debug!(%key, step_index, %reference, "adopting committed step");
                refs.push(reference);
                continue;
            }

            let action = resolve_placeholders(&step.action, &refs)?;

            // Intent reaches the disk before the store sees the write.
            let _ = self
                .log
                .record(key, step_index, action.store, EntryStatus::Pending, None, None)?;

            match self.apply_with_retry(key, step_index, &action).await {
                Ok(reference) => {
                    let _ = self.log.record(
                        key,
                        step_index,
                        action.store,
                        EntryStatus::Committed,
                        Some(reference.clone()),
                        None,
                    )?;
                    refs.push(reference);
                }
                Err(err) => {
                    warn!(%key, step_index, error = %err, "step failed, unwinding");
                    let _ = self.log.record(
                        key,
                        step_index,
                        action.store,
                        EntryStatus::Failed,
                        None,
                        Some(err.to_string()),
                    )?;
                    self.unwind(key, &steps, &refs).await?;
                    return Ok(WorkflowOutcome::Failed {
                        reason: err.to_string(),
                        partial_log: self.log.list_by_key(key)?,
                    });
                }
            }
        }

        self.log.mark_completed(key, refs.len() as u32)?;
        info!(%key, "workflow completed");
        Ok(WorkflowOutcome::Completed { refs })
    }

    /// Recorded references of a completed workflow, in step order.
    fn committed_refs(&self, key: &WorkflowKey, step_count: u32) -> Result<Vec<StoreRef>> {
        let mut refs = Vec::with_capacity(step_count as usize);
        for step_index in 0..step_count {
            let entry = self.log.committed_for_step(key, step_index)?.ok_or_else(|| {
                DuplexError::Internal(format!(
                    "completed workflow '{key}' has no committed row for step {step_index}"
                ))
            })?;
            let reference = entry.reference.ok_or_else(|| {
                DuplexError::Internal(format!(
                    "committed entry for step {step_index} has no reference"
                ))
            })?;
            refs.push(reference);
        }
        Ok(refs)
    }

    /// One adapter call with bounded retries for transient failures.
    ///
    /// `max_attempts` counts the first call; permanent failures return
    /// immediately.
    async fn apply_with_retry(
        &self,
        key: &WorkflowKey,
        step_index: u32,
        action: &StepAction,
    ) -> std::result::Result<StoreRef, StoreError> {
        let adapter = self.stores.adapter(action.store);
        let mut attempt = 0u32;
        loop {
            match adapter.apply(key, step_index, action).await {
                Ok(reference) => return Ok(reference),
                Err(err) => {
                    attempt += 1;
                    if !err.is_transient() || attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = backoff_delay_with_random(
                        attempt - 1,
                        &self.retry,
                        rand::rng().random::<f64>(),
                    );
                    warn!(
                        %key, step_index, attempt, delay_ms = delay, error = %err,
                        "transient store failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// Resume a previously interrupted unwind from the log.
    ///
    /// The committed prefix is rebuilt from committed rows; steps that
    /// already have a `compensated` row are skipped inside [`Self::unwind`].
    #[allow(clippy::cast_possible_truncation)]
    async fn resume_unwind(&self, request: &WorkflowRequest) -> Result<()> {
        let key = &request.key;
        let steps = WorkflowCatalog::resolve(request, &self.stores).await?;
        let mut refs: Vec<StoreRef> = Vec::new();
        for step_index in 0..steps.len() {
            let committed = self.log.committed_for_step(key, step_index as u32)?;
            match committed.and_then(|entry| entry.reference) {
                Some(reference) => refs.push(reference),
                None => break,
            }
        }
        self.unwind(key, &steps, &refs).await
    }

    /// Compensate committed steps in reverse order.
    ///
    /// A compensation failure halts the unwind immediately: retrying would
    /// risk double-compensation, so the error carries the prefix that was
    /// unwound and the rest stays for an operator.
    #[allow(clippy::cast_possible_truncation)]
    async fn unwind(&self, key: &WorkflowKey, steps: &[Step], refs: &[StoreRef]) -> Result<()> {
        let mut unwound: Vec<u32> = Vec::new();
        for index in (0..refs.len()).rev() {
            let step_index = index as u32;
            if let Some(latest) = self.log.latest_for_step(key, step_index)? {
                if latest.status == EntryStatus::Compensated {
                    debug!(%key, step_index, "step already compensated, skipping");
                    continue;
                }
            }
            let Compensation::Inverse(inverse) = &steps[index].compensation else {
                debug!(%key, step_index, "step has no compensation, skipping");
                continue;
            };
            let inverse = resolve_placeholders(inverse, refs)?;
            let adapter = self.stores.adapter(inverse.store);
            match adapter.compensate(key, step_index, &inverse, &refs[index]).await {
                Ok(()) => {
                    let _ = self.log.record(
                        key,
                        step_index,
                        inverse.store,
                        EntryStatus::Compensated,
                        Some(refs[index].clone()),
                        None,
                    )?;
                    unwound.push(step_index);
                }
                Err(err) => {
                    error!(%key, step_index, error = %err, "compensation failed, halting unwind");
                    let _ = self.log.record(
                        key,
                        step_index,
                        inverse.store,
                        EntryStatus::Failed,
                        None,
                        Some(format!("compensation failed: {err}")),
                    )?;
                    return Err(DuplexError::Compensation {
                        key: key.as_str().to_owned(),
                        failed_step: step_index,
                        unwound,
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Replace `"$ref:N"` placeholder strings with the recorded reference of
/// step `N`.
///
/// Placeholders may only point at earlier steps; anything else is a catalog
/// bug and surfaces as an internal error.
fn resolve_placeholders(action: &StepAction, refs: &[StoreRef]) -> Result<StepAction> {
    let mut resolved = action.clone();
    resolved.payload = substitute(action.payload.clone(), refs)?;
    Ok(resolved)
}

fn substitute(value: Value, refs: &[StoreRef]) -> Result<Value> {
    match value {
        Value::String(s) => {
            if let Some(index) = s.strip_prefix("$ref:") {
                let index: usize = index.parse().map_err(|_| {
                    DuplexError::Internal(format!("malformed placeholder '{s}'"))
                })?;
                let reference = refs.get(index).ok_or_else(|| {
                    DuplexError::Internal(format!(
                        "placeholder '{s}' points past the committed prefix"
                    ))
                })?;
                Ok(Value::String(reference.as_str().to_owned()))
            } else {
                Ok(Value::String(s))
            }
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| substitute(item, refs))
                .collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let _ = out.insert(k, substitute(v, refs)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

/// Whether a terminal outcome may be cached for fast resubmission.
///
/// A cancel observed at the first step boundary produces a `Failed` outcome
/// with an empty log; nothing happened, so the key stays resubmittable and
/// the outcome is not cached.
fn cacheable_outcome(outcome: &WorkflowOutcome) -> bool {
    match outcome {
        WorkflowOutcome::AlreadyRunning => false,
        WorkflowOutcome::Failed { partial_log, .. } => !partial_log.is_empty(),
        WorkflowOutcome::Completed { .. } => true,
    }
}

fn terminal_failure_reason(history: &[OpLogEntry]) -> Option<String> {
    if !history
        .iter()
        .any(|e| matches!(e.status, EntryStatus::Failed | EntryStatus::Compensated))
    {
        return None;
    }
    let reason = history
        .iter()
        .rev()
        .find(|e| e.status == EntryStatus::Failed)
        .and_then(|e| e.detail.clone())
        .unwrap_or_else(|| "previous attempt failed".to_string());
    Some(reason)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use duplex_core::ids::EntryId;
    use duplex_core::workflow::StoreKind;
    use serde_json::json;

    fn entry(step: u32, status: EntryStatus, detail: Option<&str>) -> OpLogEntry {
        OpLogEntry {
            id: EntryId::new(),
            key: WorkflowKey::from("k"),
            step_index: step,
            store: StoreKind::Relational,
            status,
            reference: None,
            detail: detail.map(str::to_owned),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn placeholder_substitution_is_recursive() {
        let refs = vec![StoreRef::from("41"), StoreRef::from("doc_a")];
        let action = StepAction {
            store: StoreKind::Document,
            kind: duplex_core::workflow::StepKind::Create,
            target: "notifications".into(),
            payload: json!({
                "fields": {
                    "primary_ref": "$ref:0",
                    "tags": ["$ref:1", "static"],
                    "nested": { "also": "$ref:0" },
                    "count": 3,
                }
            }),
        };
        let resolved = resolve_placeholders(&action, &refs).unwrap();
        let fields = &resolved.payload["fields"];
        assert_eq!(fields["primary_ref"], "41");
        assert_eq!(fields["tags"][0], "doc_a");
        assert_eq!(fields["tags"][1], "static");
        assert_eq!(fields["nested"]["also"], "41");
        assert_eq!(fields["count"], 3);
    }

    #[test]
    fn placeholder_past_prefix_is_an_error() {
        let action = StepAction {
            store: StoreKind::Document,
            kind: duplex_core::workflow::StepKind::Create,
            target: "t".into(),
            payload: json!({"fields": {"x": "$ref:2"}}),
        };
        let err = resolve_placeholders(&action, &[StoreRef::from("1")]).unwrap_err();
        assert_matches!(err, DuplexError::Internal(_));
    }

    #[test]
    fn malformed_placeholder_is_an_error() {
        let action = StepAction {
            store: StoreKind::Document,
            kind: duplex_core::workflow::StepKind::Create,
            target: "t".into(),
            payload: json!({"fields": {"x": "$ref:zero"}}),
        };
        let err = resolve_placeholders(&action, &[]).unwrap_err();
        assert_matches!(err, DuplexError::Internal(_));
    }

    #[test]
    fn non_placeholder_strings_pass_through() {
        let action = StepAction {
            store: StoreKind::Document,
            kind: duplex_core::workflow::StepKind::Create,
            target: "t".into(),
            payload: json!({"fields": {"x": "plain", "y": "$reference"}}),
        };
        let resolved = resolve_placeholders(&action, &[]).unwrap();
        assert_eq!(resolved.payload["fields"]["x"], "plain");
        assert_eq!(resolved.payload["fields"]["y"], "$reference");
    }

    #[test]
    fn failed_outcome_with_empty_log_is_not_cached() {
        let cancelled = WorkflowOutcome::Failed {
            reason: "cancelled at step boundary".into(),
            partial_log: vec![],
        };
        assert!(!cacheable_outcome(&cancelled));

        let failed = WorkflowOutcome::Failed {
            reason: "permanent".into(),
            partial_log: vec![entry(0, EntryStatus::Failed, None)],
        };
        assert!(cacheable_outcome(&failed));
        assert!(cacheable_outcome(&WorkflowOutcome::Completed { refs: vec![] }));
        assert!(!cacheable_outcome(&WorkflowOutcome::AlreadyRunning));
    }

    #[test]
    fn terminal_failure_reason_prefers_latest_detail() {
        let history = vec![
            entry(0, EntryStatus::Pending, None),
            entry(0, EntryStatus::Committed, None),
            entry(1, EntryStatus::Failed, Some("permanent document store error: dup")),
            entry(0, EntryStatus::Compensated, None),
        ];
        assert_eq!(
            terminal_failure_reason(&history).as_deref(),
            Some("permanent document store error: dup")
        );
        assert!(terminal_failure_reason(&history[..2]).is_none());
    }
}
