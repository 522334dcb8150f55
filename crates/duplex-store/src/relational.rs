//! In-memory relational store.
//!
//! Tables of rows with generated integer keys. Operation shapes mirror a
//! parameterized-statement client: insert produces a generated identifier,
//! update/delete produce an affected-row count.
//!
//! Payload conventions per step kind:
//!
//! - `create`: `{"fields": {..}}` — reference is the generated row id
//! - `update`: `{"filter": {..}, "fields": {..}, "increment": {..}}` —
//!   reference is `"affected:<n>"`
//! - `delete`: `{"filter": {..}}` — reference is `"affected:<n>"`
//!
//! Filters are field-equality conjunctions. `increment` adds a numeric delta
//! to each named field, which is what the engagement-sync workflow needs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use duplex_core::errors::StoreError;
use duplex_core::ids::{StoreRef, WorkflowKey};
use duplex_core::workflow::{StepAction, StepKind, StoreKind};

use crate::adapter::{FaultKind, RefRecord, StoreAdapter};

#[derive(Debug)]
struct Row {
    fields: Map<String, Value>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Row>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    applied: HashMap<(String, u32), StoreRef>,
    // One slot per upcoming apply/compensate; None lets the call through.
    faults: VecDeque<Option<FaultKind>>,
    compensate_faults: VecDeque<Option<FaultKind>>,
}

/// In-memory relational store with generated integer row ids.
#[derive(Default)]
pub struct RelationalStore {
    state: Mutex<State>,
    writes: AtomicU64,
}

impl RelationalStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next fresh `apply` call.
    pub fn fail_next(&self, kind: FaultKind) {
        self.state.lock().faults.push_back(Some(kind));
    }

    /// Let the next fresh `apply` call through, shifting queued faults to
    /// later calls.
    pub fn pass_next(&self) {
        self.state.lock().faults.push_back(None);
    }

    /// Queue a fault for the next `compensate` call.
    pub fn fail_next_compensate(&self, kind: FaultKind) {
        self.state.lock().compensate_faults.push_back(Some(kind));
    }

    /// Number of successful mutations (adapter writes only, not seeding).
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed a row directly, bypassing the adapter path. Returns the row id.
    pub fn seed_row(&self, table: &str, fields: Map<String, Value>) -> i64 {
        self.seed_row_at(table, fields, Utc::now())
    }

    /// Seed a row with an explicit creation time, for aging scenarios.
    pub fn seed_row_at(
        &self,
        table: &str,
        fields: Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> i64 {
        let mut state = self.state.lock();
        let table = state.tables.entry(table.to_owned()).or_default();
        table.next_id += 1;
        let id = table.next_id;
        let _ = table.rows.insert(id, Row { fields, created_at });
        id
    }

    /// Fetch one row's fields by id, for assertions.
    #[must_use]
    pub fn get_row(&self, table: &str, id: i64) -> Option<Value> {
        let state = self.state.lock();
        state
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&id))
            .map(|row| Value::Object(row.fields.clone()))
    }

    /// Number of rows in a table.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock();
        state.tables.get(table).map_or(0, |t| t.rows.len())
    }

    fn err(kind: FaultKind, message: &str) -> StoreError {
        match kind {
            FaultKind::Transient => StoreError::transient(StoreKind::Relational, message),
            FaultKind::Permanent => StoreError::permanent(StoreKind::Relational, message),
        }
    }

    fn malformed(message: impl Into<String>) -> StoreError {
        StoreError::permanent(StoreKind::Relational, message.into())
    }
}

fn as_object<'a>(payload: &'a Value, field: &str) -> Option<&'a Map<String, Value>> {
    payload.get(field).and_then(Value::as_object)
}

fn row_matches(fields: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(k, v)| fields.get(k) == Some(v))
}

fn apply_mutation(row: &mut Row, set: Option<&Map<String, Value>>, increment: Option<&Map<String, Value>>) {
    if let Some(set) = set {
        for (k, v) in set {
            let _ = row.fields.insert(k.clone(), v.clone());
        }
    }
    if let Some(increment) = increment {
        for (k, delta) in increment {
            let delta = delta.as_i64().unwrap_or(0);
            let current = row.fields.get(k).and_then(Value::as_i64).unwrap_or(0);
            let _ = row.fields.insert(k.clone(), Value::from(current + delta));
        }
    }
}

#[async_trait]
impl StoreAdapter for RelationalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    async fn apply(
        &self,
        key: &WorkflowKey,
        step_index: u32,
        action: &StepAction,
    ) -> Result<StoreRef, StoreError> {
        let mut state = self.state.lock();

        // Idempotent replay: already-applied pairs return the recorded
        // reference without a second side effect (and without consuming
        // injected faults).
        if let Some(reference) = state.applied.get(&(key.as_str().to_owned(), step_index)) {
            debug!(%key, step_index, %reference, "relational apply suppressed (already applied)");
            return Ok(reference.clone());
        }

        if let Some(Some(kind)) = state.faults.pop_front() {
            return Err(Self::err(kind, "injected fault"));
        }

        let reference = match action.kind {
            StepKind::Create => {
                let fields = as_object(&action.payload, "fields")
                    .ok_or_else(|| Self::malformed("create payload missing fields object"))?
                    .clone();
                let table = state.tables.entry(action.target.clone()).or_default();
                table.next_id += 1;
                let id = table.next_id;
                let _ = table.rows.insert(
                    id,
                    Row {
                        fields,
                        created_at: Utc::now(),
                    },
                );
                StoreRef::from(id.to_string())
            }
            StepKind::Update => {
                let filter = as_object(&action.payload, "filter").cloned().unwrap_or_default();
                let set = as_object(&action.payload, "fields").cloned();
                let increment = as_object(&action.payload, "increment").cloned();
                if set.is_none() && increment.is_none() {
                    return Err(Self::malformed("update payload has neither fields nor increment"));
                }
                let table = state.tables.entry(action.target.clone()).or_default();
                let mut affected = 0i64;
                for row in table.rows.values_mut() {
                    if row_matches(&row.fields, &filter) {
                        apply_mutation(row, set.as_ref(), increment.as_ref());
                        affected += 1;
                    }
                }
                StoreRef::from(format!("affected:{affected}"))
            }
            StepKind::Delete => {
                let filter = as_object(&action.payload, "filter").cloned().unwrap_or_default();
                let table = state.tables.entry(action.target.clone()).or_default();
                let doomed: Vec<i64> = table
                    .rows
                    .iter()
                    .filter(|(_, row)| row_matches(&row.fields, &filter))
                    .map(|(id, _)| *id)
                    .collect();
                for id in &doomed {
                    let _ = table.rows.remove(id);
                }
                StoreRef::from(format!("affected:{}", doomed.len()))
            }
        };

        let _ = self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = state
            .applied
            .insert((key.as_str().to_owned(), step_index), reference.clone());
        debug!(%key, step_index, target = %action.target, %reference, "relational apply");
        Ok(reference)
    }

    async fn compensate(
        &self,
        key: &WorkflowKey,
        step_index: u32,
        action: &StepAction,
        reference: &StoreRef,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();

        if let Some(Some(kind)) = state.compensate_faults.pop_front() {
            return Err(Self::err(kind, "injected compensation fault"));
        }

        match action.kind {
            // Undo of a create: delete the referenced row. A missing row is
            // fine — the forward write may never have landed.
            StepKind::Delete => {
                if let Ok(id) = reference.as_str().parse::<i64>() {
                    if let Some(table) = state.tables.get_mut(&action.target) {
                        let _ = table.rows.remove(&id);
                    }
                } else {
                    let filter =
                        as_object(&action.payload, "filter").cloned().unwrap_or_default();
                    let table = state.tables.entry(action.target.clone()).or_default();
                    let doomed: Vec<i64> = table
                        .rows
                        .iter()
                        .filter(|(_, row)| row_matches(&row.fields, &filter))
                        .map(|(id, _)| *id)
                        .collect();
                    for id in &doomed {
                        let _ = table.rows.remove(id);
                    }
                }
            }
            // Undo of an update: the inverse mutation as given (the catalog
            // builds the negated increment).
            StepKind::Update => {
                let filter = as_object(&action.payload, "filter").cloned().unwrap_or_default();
                let set = as_object(&action.payload, "fields").cloned();
                let increment = as_object(&action.payload, "increment").cloned();
                let table = state.tables.entry(action.target.clone()).or_default();
                for row in table.rows.values_mut() {
                    if row_matches(&row.fields, &filter) {
                        apply_mutation(row, set.as_ref(), increment.as_ref());
                    }
                }
            }
            // Undo of a delete: re-insert the payload fields.
            StepKind::Create => {
                let fields = as_object(&action.payload, "fields")
                    .ok_or_else(|| Self::malformed("create compensation missing fields object"))?
                    .clone();
                let table = state.tables.entry(action.target.clone()).or_default();
                table.next_id += 1;
                let id = table.next_id;
                let _ = table.rows.insert(
                    id,
                    Row {
                        fields,
                        created_at: Utc::now(),
                    },
                );
            }
        }

        let _ = self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(%key, step_index, target = %action.target, "relational compensate");
        Ok(())
    }

    async fn list_refs(&self, target: &str) -> Result<Vec<RefRecord>, StoreError> {
        let state = self.state.lock();
        let Some(table) = state.tables.get(target) else {
            return Ok(Vec::new());
        };
        Ok(table
            .rows
            .iter()
            .map(|(id, row)| RefRecord {
                cross_key: id.to_string(),
                reference: StoreRef::from(id.to_string()),
                created_at: row.created_at,
            })
            .collect())
    }

    async fn grouped_counts(
        &self,
        target: &str,
        group_by: &str,
        min_count: i64,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let state = self.state.lock();
        let Some(table) = state.tables.get(target) else {
            return Ok(Vec::new());
        };
        let mut groups: BTreeMap<String, i64> = BTreeMap::new();
        for row in table.rows.values() {
            if let Some(value) = row.fields.get(group_by) {
                let group = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                *groups.entry(group).or_insert(0) += 1;
            }
        }
        Ok(groups
            .into_iter()
            .filter(|(_, count)| *count >= min_count)
            .collect())
    }

    async fn count(&self, target: &str) -> Result<i64, StoreError> {
        let state = self.state.lock();
        Ok(state.tables.get(target).map_or(0, |t| t.rows.len() as i64))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
