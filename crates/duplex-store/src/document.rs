//! In-memory document store.
//!
//! Collections of schemaless JSON documents with opaque generated ids.
//! Operation shapes mirror a document-database client: inserts return the
//! generated id, updates are filter-driven upserts supporting field-set and
//! array-push mutations.
//!
//! Payload conventions per step kind:
//!
//! - `create`: `{"fields": {..}}` — reference is the generated document id
//! - `update`: `{"filter": {..}, "set": {..}, "push": {..}}` — upsert; the
//!   reference is the matched (or created) document id
//! - `delete`: `{"filter": {..}}` — reference is `"removed:<n>"`
//!
//! Cross-store identity rides in the `primary_ref` field: documents that
//! shadow a relational row carry the row id there, and [`list_refs`] reports
//! it as the record's cross key.
//!
//! [`list_refs`]: StoreAdapter::list_refs

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use duplex_core::errors::StoreError;
use duplex_core::ids::{StoreRef, WorkflowKey};
use duplex_core::workflow::{StepAction, StepKind, StoreKind};

use crate::adapter::{FaultKind, RefRecord, StoreAdapter};

/// Field carrying the cross-store key on shadowing documents.
pub const PRIMARY_REF_FIELD: &str = "primary_ref";

#[derive(Debug)]
struct Document {
    fields: Map<String, Value>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    // BTreeMap keeps iteration order stable for listings.
    collections: HashMap<String, BTreeMap<String, Document>>,
    applied: HashMap<(String, u32), StoreRef>,
    // One slot per upcoming apply/compensate; None lets the call through.
    faults: VecDeque<Option<FaultKind>>,
    compensate_faults: VecDeque<Option<FaultKind>>,
}

/// In-memory document store with opaque generated ids.
#[derive(Default)]
pub struct DocumentStore {
    state: Mutex<State>,
    writes: AtomicU64,
}

impl DocumentStore {
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

    /// Seed a document directly, bypassing the adapter path. Returns its id.
    pub fn seed_doc(&self, collection: &str, fields: Map<String, Value>) -> String {
        self.seed_doc_at(collection, fields, Utc::now())
    }

    /// Seed a document with an explicit creation time, for aging scenarios.
    pub fn seed_doc_at(
        &self,
        collection: &str,
        fields: Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> String {
        let mut state = self.state.lock();
        let id = new_doc_id();
        let _ = state
            .collections
            .entry(collection.to_owned())
            .or_default()
            .insert(id.clone(), Document { fields, created_at });
        id
    }

    /// Fetch one document's fields by id, for assertions.
    #[must_use]
    pub fn get_doc(&self, collection: &str, id: &str) -> Option<Value> {
        let state = self.state.lock();
        state
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|doc| Value::Object(doc.fields.clone()))
    }

    /// First document matching a field-equality filter, for assertions.
    #[must_use]
    pub fn find_doc(&self, collection: &str, filter: &Map<String, Value>) -> Option<Value> {
        let state = self.state.lock();
        state.collections.get(collection).and_then(|c| {
            c.values()
                .find(|doc| doc_matches(&doc.fields, filter))
                .map(|doc| Value::Object(doc.fields.clone()))
        })
    }

    /// Number of documents in a collection.
    #[must_use]
    pub fn doc_count(&self, collection: &str) -> usize {
        let state = self.state.lock();
        state.collections.get(collection).map_or(0, BTreeMap::len)
    }

    fn err(kind: FaultKind, message: &str) -> StoreError {
        match kind {
            FaultKind::Transient => StoreError::transient(StoreKind::Document, message),
            FaultKind::Permanent => StoreError::permanent(StoreKind::Document, message),
        }
    }

    fn malformed(message: impl Into<String>) -> StoreError {
        StoreError::permanent(StoreKind::Document, message.into())
    }
}

fn new_doc_id() -> String {
    format!("doc_{}", Uuid::now_v7().simple())
}

fn as_object<'a>(payload: &'a Value, field: &str) -> Option<&'a Map<String, Value>> {
    payload.get(field).and_then(Value::as_object)
}

fn doc_matches(fields: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(k, v)| fields.get(k) == Some(v))
}

fn apply_set_and_push(
    fields: &mut Map<String, Value>,
    set: Option<&Map<String, Value>>,
    push: Option<&Map<String, Value>>,
) {
    if let Some(set) = set {
        for (k, v) in set {
            let _ = fields.insert(k.clone(), v.clone());
        }
    }
    if let Some(push) = push {
        for (k, v) in push {
            match fields.get_mut(k) {
                Some(Value::Array(items)) => items.push(v.clone()),
                _ => {
                    let _ = fields.insert(k.clone(), Value::Array(vec![v.clone()]));
                }
            }
        }
    }
}

#[async_trait]
impl StoreAdapter for DocumentStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Document
    }

    async fn apply(
        &self,
        key: &WorkflowKey,
        step_index: u32,
        action: &StepAction,
    ) -> Result<StoreRef, StoreError> {
        let mut state = self.state.lock();

        // Idempotent replay returns the recorded reference and consumes no
        // injected faults.
        if let Some(reference) = state.applied.get(&(key.as_str().to_owned(), step_index)) {
            debug!(%key, step_index, %reference, "document apply suppressed (already applied)");
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
                let id = new_doc_id();
                let _ = state.collections.entry(action.target.clone()).or_default().insert(
                    id.clone(),
                    Document {
                        fields,
                        created_at: Utc::now(),
                    },
                );
                StoreRef::from(id)
            }
            StepKind::Update => {
                let filter = as_object(&action.payload, "filter").cloned().unwrap_or_default();
                let set = as_object(&action.payload, "set").cloned();
                let push = as_object(&action.payload, "push").cloned();
                if set.is_none() && push.is_none() {
                    return Err(Self::malformed("update payload has neither set nor push"));
                }
                let collection = state.collections.entry(action.target.clone()).or_default();
                let matched = collection
                    .iter()
                    .find(|(_, doc)| doc_matches(&doc.fields, &filter))
                    .map(|(id, _)| id.clone());
                match matched {
                    Some(id) => {
                        let doc = collection
                            .get_mut(&id)
                            .ok_or_else(|| Self::malformed("matched document vanished"))?;
                        apply_set_and_push(&mut doc.fields, set.as_ref(), push.as_ref());
                        StoreRef::from(id)
                    }
                    // Upsert: the filter fields seed the new document.
                    None => {
                        let id = new_doc_id();
                        let mut fields = filter;
                        apply_set_and_push(&mut fields, set.as_ref(), push.as_ref());
                        let _ = collection.insert(
                            id.clone(),
                            Document {
                                fields,
                                created_at: Utc::now(),
                            },
                        );
                        StoreRef::from(id)
                    }
                }
            }
            StepKind::Delete => {
                let filter = as_object(&action.payload, "filter").cloned().unwrap_or_default();
                let collection = state.collections.entry(action.target.clone()).or_default();
                let doomed: Vec<String> = collection
                    .iter()
                    .filter(|(_, doc)| doc_matches(&doc.fields, &filter))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &doomed {
                    let _ = collection.remove(id);
                }
                StoreRef::from(format!("removed:{}", doomed.len()))
            }
        };

        let _ = self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = state
            .applied
            .insert((key.as_str().to_owned(), step_index), reference.clone());
        debug!(%key, step_index, target = %action.target, %reference, "document apply");
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
            // Undo of a create: remove the referenced document. Missing is
            // fine, the forward write may never have landed.
            StepKind::Delete => {
                if reference.as_str().starts_with("doc_") {
                    if let Some(collection) = state.collections.get_mut(&action.target) {
                        let _ = collection.remove(reference.as_str());
                    }
                } else {
                    let filter =
                        as_object(&action.payload, "filter").cloned().unwrap_or_default();
                    let collection = state.collections.entry(action.target.clone()).or_default();
                    let doomed: Vec<String> = collection
                        .iter()
                        .filter(|(_, doc)| doc_matches(&doc.fields, &filter))
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in &doomed {
                        let _ = collection.remove(id);
                    }
                }
            }
            // Undo of an update: apply the inverse mutation as given.
            StepKind::Update => {
                let filter = as_object(&action.payload, "filter").cloned().unwrap_or_default();
                let set = as_object(&action.payload, "set").cloned();
                let push = as_object(&action.payload, "push").cloned();
                let collection = state.collections.entry(action.target.clone()).or_default();
                for doc in collection.values_mut() {
                    if doc_matches(&doc.fields, &filter) {
                        apply_set_and_push(&mut doc.fields, set.as_ref(), push.as_ref());
                    }
                }
            }
            // Undo of a delete: re-insert the payload fields.
            StepKind::Create => {
                let fields = as_object(&action.payload, "fields")
                    .ok_or_else(|| Self::malformed("create compensation missing fields object"))?
                    .clone();
                let id = new_doc_id();
                let _ = state.collections.entry(action.target.clone()).or_default().insert(
                    id,
                    Document {
                        fields,
                        created_at: Utc::now(),
                    },
                );
            }
        }

        let _ = self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(%key, step_index, target = %action.target, "document compensate");
        Ok(())
    }

    async fn list_refs(&self, target: &str) -> Result<Vec<RefRecord>, StoreError> {
        let state = self.state.lock();
        let Some(collection) = state.collections.get(target) else {
            return Ok(Vec::new());
        };
        Ok(collection
            .iter()
            .map(|(id, doc)| {
                let cross_key = doc
                    .fields
                    .get(PRIMARY_REF_FIELD)
                    .map_or_else(|| id.clone(), value_as_key);
                RefRecord {
                    cross_key,
                    reference: StoreRef::from(id.clone()),
                    created_at: doc.created_at,
                }
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
        let Some(collection) = state.collections.get(target) else {
            return Ok(Vec::new());
        };
        let mut groups: BTreeMap<String, i64> = BTreeMap::new();
        for doc in collection.values() {
            if let Some(value) = doc.fields.get(group_by) {
                *groups.entry(value_as_key(value)).or_insert(0) += 1;
            }
        }
        Ok(groups
            .into_iter()
            .filter(|(_, count)| *count >= min_count)
            .collect())
    }

    async fn count(&self, target: &str) -> Result<i64, StoreError> {
        let state = self.state.lock();
        Ok(state.collections.get(target).map_or(0, |c| c.len() as i64))
    }
}

fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn create_action(target: &str, fields: Value) -> StepAction {
        StepAction {
            store: StoreKind::Document,
            kind: StepKind::Create,
            target: target.into(),
            payload: json!({ "fields": fields }),
        }
    }

    #[tokio::test]
    async fn create_returns_opaque_id() {
        let store = DocumentStore::new();
        let r = store
            .apply(
                &WorkflowKey::from("k"),
                0,
                &create_action("user_activities", json!({"activity_type": "registration"})),
            )
            .await
            .unwrap();
        assert!(r.as_str().starts_with("doc_"));
        assert_eq!(store.doc_count("user_activities"), 1);
    }

    #[tokio::test]
    async fn apply_is_idempotent_per_key_and_step() {
        let store = DocumentStore::new();
        let key = WorkflowKey::from("k");
        let action = create_action("notifications", json!({"title": "hello"}));
        let r1 = store.apply(&key, 1, &action).await.unwrap();
        let writes = store.write_count();
        let r2 = store.apply(&key, 1, &action).await.unwrap();
        assert_eq!(r1, r2);
        assert_eq!(store.write_count(), writes);
        assert_eq!(store.doc_count("notifications"), 1);
    }

    #[tokio::test]
    async fn update_upserts_when_no_match() {
        let store = DocumentStore::new();
        let action = StepAction {
            store: StoreKind::Document,
            kind: StepKind::Update,
            target: "real_time_chats".into(),
            payload: json!({
                "filter": {"room_id": "general"},
                "set": {"last_active": "t0"},
                "push": {"messages": {"text": "hi"}},
            }),
        };
        let r = store.apply(&WorkflowKey::from("k"), 0, &action).await.unwrap();
        let doc = store.get_doc("real_time_chats", r.as_str()).unwrap();
        assert_eq!(doc["room_id"], json!("general"));
        assert_eq!(doc["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_pushes_onto_existing_array() {
        let store = DocumentStore::new();
        let key_a = WorkflowKey::from("a");
        let key_b = WorkflowKey::from("b");
        let action = |text: &str| StepAction {
            store: StoreKind::Document,
            kind: StepKind::Update,
            target: "real_time_chats".into(),
            payload: json!({
                "filter": {"room_id": "general"},
                "push": {"messages": {"text": text}},
            }),
        };
        let r1 = store.apply(&key_a, 0, &action("one")).await.unwrap();
        let r2 = store.apply(&key_b, 0, &action("two")).await.unwrap();
        assert_eq!(r1, r2, "same room document");
        assert_eq!(store.doc_count("real_time_chats"), 1);
        let doc = store.get_doc("real_time_chats", r1.as_str()).unwrap();
        assert_eq!(doc["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn injected_permanent_fault() {
        let store = DocumentStore::new();
        store.fail_next(FaultKind::Permanent);
        let err = store
            .apply(
                &WorkflowKey::from("k"),
                0,
                &create_action("notifications", json!({})),
            )
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::Permanent { .. });
    }

    #[tokio::test]
    async fn compensate_delete_removes_referenced_doc() {
        let store = DocumentStore::new();
        let key = WorkflowKey::from("k");
        let reference = store
            .apply(&key, 0, &create_action("notifications", json!({"title": "x"})))
            .await
            .unwrap();
        let inverse = StepAction {
            store: StoreKind::Document,
            kind: StepKind::Delete,
            target: "notifications".into(),
            payload: json!({}),
        };
        store.compensate(&key, 0, &inverse, &reference).await.unwrap();
        assert_eq!(store.doc_count("notifications"), 0);

        // Running it again is a no-op, not an error.
        store.compensate(&key, 0, &inverse, &reference).await.unwrap();
    }

    #[tokio::test]
    async fn list_refs_uses_primary_ref_as_cross_key() {
        let store = DocumentStore::new();
        let _ = store.seed_doc(
            "user_activities",
            json!({"primary_ref": "42", "activity_type": "registration"})
                .as_object()
                .unwrap()
                .clone(),
        );
        let refs = store.list_refs("user_activities").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].cross_key, "42");
        assert!(refs[0].reference.as_str().starts_with("doc_"));
    }

    #[tokio::test]
    async fn grouped_counts_mirrors_aggregation() {
        let store = DocumentStore::new();
        for user in ["u1", "u1", "u1", "u2"] {
            let _ = store.seed_doc(
                "user_activities",
                json!({"user_ref": user}).as_object().unwrap().clone(),
            );
        }
        let groups = store.grouped_counts("user_activities", "user_ref", 3).await.unwrap();
        assert_eq!(groups, vec![("u1".to_string(), 3)]);
    }
}
