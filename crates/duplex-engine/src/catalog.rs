//! Workflow catalog.
//!
//! Maps a workflow name plus request params to the ordered steps the
//! coordinator executes. Resolution is async because two of the workflows
//! derive their steps from store reads: `snapshot_analytics` samples counts
//! from both stores, and `sync_engagement` turns a document-side aggregation
//! into one relational update per qualifying user.
//!
//! Payloads may carry `"$ref:N"` placeholder strings; the coordinator
//! substitutes the recorded reference of step `N` before the action reaches
//! an adapter. Creating an activity document that points back at the row
//! generated in step 0 is the typical use.

use chrono::Utc;
use serde_json::{json, Value};

use duplex_core::errors::{DuplexError, Result};
use duplex_core::workflow::{Compensation, Step, StepAction, StepKind, StoreKind, WorkflowRequest};

use crate::stores::StorePair;

/// Default engagement threshold for `sync_engagement`.
const DEFAULT_MIN_ENGAGEMENT: i64 = 3;

/// Resolves workflow names to executable step lists.
pub struct WorkflowCatalog;

impl WorkflowCatalog {
    /// Resolve a request into the ordered steps to run.
    ///
    /// # Errors
    ///
    /// [`DuplexError::UnknownWorkflow`] for a name the catalog does not
    /// define, [`DuplexError::InvalidParams`] for missing or mistyped
    /// params, and [`DuplexError::Store`] when a derivation read fails.
    pub async fn resolve(request: &WorkflowRequest, stores: &StorePair) -> Result<Vec<Step>> {
        match request.workflow.as_str() {
            "register_user" => register_user(&request.params),
            "register_for_event" => register_for_event(&request.params),
            "post_chat_message" => post_chat_message(&request.params),
            "snapshot_analytics" => snapshot_analytics(stores).await,
            "sync_engagement" => sync_engagement(&request.params, stores).await,
            "restore_shadow" => restore_shadow(&request.params),
            other => Err(DuplexError::UnknownWorkflow(other.to_string())),
        }
    }

    /// Whether the catalog defines a workflow with this name.
    #[must_use]
    pub fn contains(name: &str) -> bool {
        matches!(
            name,
            "register_user"
                | "register_for_event"
                | "post_chat_message"
                | "snapshot_analytics"
                | "sync_engagement"
                | "restore_shadow"
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workflows
// ─────────────────────────────────────────────────────────────────────────────

/// User registration: relational row plus activity and notification shadows.
fn register_user(params: &Value) -> Result<Vec<Step>> {
    let username = required_str(params, "username")?;
    let email = required_str(params, "email")?;
    let full_name = required_str(params, "full_name")?;
    let role = params
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("student");

    Ok(vec![
        create_step(
            StoreKind::Relational,
            "users",
            json!({
                "username": username,
                "email": email,
                "full_name": full_name,
                "role": role,
            }),
        ),
        create_step(
            StoreKind::Document,
            "user_activities",
            json!({
                "primary_ref": "$ref:0",
                "username": username,
                "activity_type": "registration",
                "details": { "role": role },
            }),
        ),
        create_step(
            StoreKind::Document,
            "notifications",
            json!({
                "primary_ref": "$ref:0",
                "type": "welcome",
                "title": "Welcome aboard!",
                "message": format!("Hi {full_name}, your account is ready."),
                "read": false,
            }),
        ),
    ])
}

/// Event registration for an existing user.
fn register_for_event(params: &Value) -> Result<Vec<Step>> {
    let user_ref = required_str(params, "user_ref")?;
    let username = required_str(params, "username")?;
    let event_name = required_str(params, "event_name")?;

    Ok(vec![
        create_step(
            StoreKind::Relational,
            "event_registrations",
            json!({
                "user_id": user_ref,
                "event_name": event_name,
                "status": "confirmed",
            }),
        ),
        create_step(
            StoreKind::Document,
            "user_activities",
            json!({
                "primary_ref": "$ref:0",
                "user_ref": user_ref,
                "username": username,
                "activity_type": "event_registration",
                "details": { "event_name": event_name },
            }),
        ),
        create_step(
            StoreKind::Document,
            "notifications",
            json!({
                "primary_ref": "$ref:0",
                "user_ref": user_ref,
                "type": "event_confirmation",
                "title": format!("Registered: {event_name}"),
                "message": format!("{username} is registered for {event_name}."),
                "read": false,
            }),
        ),
    ])
}

/// Chat append: single upsert into the room document.
///
/// Compensation is `None`: a failed later step cannot exist (this is the
/// only step), and the adapter suppresses replays of the append itself.
fn post_chat_message(params: &Value) -> Result<Vec<Step>> {
    let room_id = required_str(params, "room_id")?;
    let user_ref = required_str(params, "user_ref")?;
    let username = required_str(params, "username")?;
    let text = required_str(params, "text")?;
    let now = Utc::now().to_rfc3339();

    Ok(vec![Step {
        action: StepAction {
            store: StoreKind::Document,
            kind: StepKind::Update,
            target: "real_time_chats".to_string(),
            payload: json!({
                "filter": { "room_id": room_id },
                "set": { "last_active": now },
                "push": {
                    "messages": {
                        "user_ref": user_ref,
                        "username": username,
                        "text": text,
                        "sent_at": now,
                    }
                },
            }),
        },
        compensation: Compensation::None,
    }])
}

/// Cross-store analytics snapshot, written as one document.
async fn snapshot_analytics(stores: &StorePair) -> Result<Vec<Step>> {
    let roles = stores
        .relational
        .grouped_counts("users", "role", 0)
        .await
        .map_err(DuplexError::from)?;
    let registration_count = stores
        .relational
        .count("event_registrations")
        .await
        .map_err(DuplexError::from)?;
    let activity_count = stores
        .document
        .count("user_activities")
        .await
        .map_err(DuplexError::from)?;
    let notification_count = stores
        .document
        .count("notifications")
        .await
        .map_err(DuplexError::from)?;
    let chat_room_count = stores
        .document
        .count("real_time_chats")
        .await
        .map_err(DuplexError::from)?;

    let users_by_role: serde_json::Map<String, Value> = roles
        .into_iter()
        .map(|(role, count)| (role, Value::from(count)))
        .collect();

    Ok(vec![create_step(
        StoreKind::Document,
        "analytics",
        json!({
            "generated_at": Utc::now().to_rfc3339(),
            "users_by_role": users_by_role,
            "event_registration_count": registration_count,
            "activity_count": activity_count,
            "notification_count": notification_count,
            "chat_room_count": chat_room_count,
        }),
    )])
}

/// Push document-side engagement back into relational vote counts.
///
/// Users with at least `min_engagement` activity documents get that count
/// added to the `upvote_count` of their posts. One step per qualifying user;
/// no qualifying users resolves to an empty workflow.
async fn sync_engagement(params: &Value, stores: &StorePair) -> Result<Vec<Step>> {
    let min_engagement = params
        .get("min_engagement")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_MIN_ENGAGEMENT);
    if min_engagement < 1 {
        return Err(DuplexError::InvalidParams(
            "min_engagement must be at least 1".to_string(),
        ));
    }

    let engaged = stores
        .document
        .grouped_counts("user_activities", "user_ref", min_engagement)
        .await
        .map_err(DuplexError::from)?;

    Ok(engaged
        .into_iter()
        .map(|(user_ref, count)| Step {
            action: StepAction {
                store: StoreKind::Relational,
                kind: StepKind::Update,
                target: "posts".to_string(),
                payload: json!({
                    "filter": { "user_id": user_ref },
                    "increment": { "upvote_count": count },
                }),
            },
            compensation: Compensation::Inverse(StepAction {
                store: StoreKind::Relational,
                kind: StepKind::Update,
                target: "posts".to_string(),
                payload: json!({
                    "filter": { "user_id": user_ref },
                    "increment": { "upvote_count": -count },
                }),
            }),
        })
        .collect())
}

/// Recreate a missing shadow document for an existing primary row.
///
/// Submitted by the reconciler when a sweep finds a relational row with no
/// document carrying its cross key.
fn restore_shadow(params: &Value) -> Result<Vec<Step>> {
    let collection = required_str(params, "collection")?;
    let primary_ref = required_str(params, "primary_ref")?;

    Ok(vec![create_step(
        StoreKind::Document,
        collection,
        json!({
            "primary_ref": primary_ref,
            "restored": true,
            "restored_at": Utc::now().to_rfc3339(),
        }),
    )])
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// A create step whose compensation deletes the referenced row or document.
///
/// The delete payload is empty: adapters target the recorded reference of
/// the committed step, which stays correct even when the forward payload
/// contained placeholders.
fn create_step(store: StoreKind, target: &str, fields: Value) -> Step {
    Step {
        action: StepAction {
            store,
            kind: StepKind::Create,
            target: target.to_string(),
            payload: json!({ "fields": fields }),
        },
        compensation: Compensation::Inverse(StepAction {
            store,
            kind: StepKind::Delete,
            target: target.to_string(),
            payload: json!({}),
        }),
    }
}

fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| DuplexError::InvalidParams(format!("missing string param '{field}'")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use duplex_core::ids::WorkflowKey;
    use duplex_store::{DocumentStore, RelationalStore};
    use std::sync::Arc;

    fn stores() -> (Arc<RelationalStore>, Arc<DocumentStore>, StorePair) {
        let relational = Arc::new(RelationalStore::new());
        let document = Arc::new(DocumentStore::new());
        let pair = StorePair {
            relational: relational.clone(),
            document: document.clone(),
        };
        (relational, document, pair)
    }

    fn request(workflow: &str, params: Value) -> WorkflowRequest {
        WorkflowRequest {
            key: WorkflowKey::from("test-key"),
            workflow: workflow.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn register_user_resolves_three_steps() {
        let (_, _, pair) = stores();
        let steps = WorkflowCatalog::resolve(
            &request(
                "register_user",
                json!({"username": "ada", "email": "ada@campus.edu", "full_name": "Ada Lovelace"}),
            ),
            &pair,
        )
        .await
        .unwrap();

        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].action.store, StoreKind::Relational);
        assert_eq!(steps[0].action.target, "users");
        assert_eq!(steps[1].action.target, "user_activities");
        assert_eq!(steps[1].action.payload["fields"]["primary_ref"], "$ref:0");
        assert_eq!(steps[2].action.target, "notifications");
        // Role defaults when absent.
        assert_eq!(steps[0].action.payload["fields"]["role"], "student");
        assert_matches!(steps[0].compensation, Compensation::Inverse(_));
    }

    #[tokio::test]
    async fn register_user_missing_param() {
        let (_, _, pair) = stores();
        let err = WorkflowCatalog::resolve(
            &request("register_user", json!({"username": "ada"})),
            &pair,
        )
        .await
        .unwrap_err();
        assert_matches!(err, DuplexError::InvalidParams(_));
    }

    #[tokio::test]
    async fn chat_message_has_no_compensation() {
        let (_, _, pair) = stores();
        let steps = WorkflowCatalog::resolve(
            &request(
                "post_chat_message",
                json!({"room_id": "general", "user_ref": "1", "username": "ada", "text": "hi"}),
            ),
            &pair,
        )
        .await
        .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action.kind, StepKind::Update);
        assert_matches!(steps[0].compensation, Compensation::None);
    }

    #[tokio::test]
    async fn snapshot_analytics_samples_both_stores() {
        let (relational, document, pair) = stores();
        for role in ["student", "student", "lecturer"] {
            let _ = relational.seed_row(
                "users",
                json!({"role": role}).as_object().unwrap().clone(),
            );
        }
        let _ = document.seed_doc(
            "user_activities",
            json!({"user_ref": "1"}).as_object().unwrap().clone(),
        );

        let steps = WorkflowCatalog::resolve(&request("snapshot_analytics", json!({})), &pair)
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        let fields = &steps[0].action.payload["fields"];
        assert_eq!(fields["users_by_role"]["student"], 2);
        assert_eq!(fields["users_by_role"]["lecturer"], 1);
        assert_eq!(fields["activity_count"], 1);
        assert_eq!(fields["notification_count"], 0);
    }

    #[tokio::test]
    async fn sync_engagement_emits_one_step_per_qualifying_user() {
        let (_, document, pair) = stores();
        for user in ["u1", "u1", "u1", "u2"] {
            let _ = document.seed_doc(
                "user_activities",
                json!({"user_ref": user}).as_object().unwrap().clone(),
            );
        }

        let steps = WorkflowCatalog::resolve(&request("sync_engagement", json!({})), &pair)
            .await
            .unwrap();
        assert_eq!(steps.len(), 1, "only u1 reaches the default threshold");
        assert_eq!(steps[0].action.payload["filter"]["user_id"], "u1");
        assert_eq!(steps[0].action.payload["increment"]["upvote_count"], 3);
        let Compensation::Inverse(inverse) = &steps[0].compensation else {
            panic!("engagement steps carry an inverse");
        };
        assert_eq!(inverse.payload["increment"]["upvote_count"], -3);
    }

    #[tokio::test]
    async fn sync_engagement_with_no_qualifiers_is_empty() {
        let (_, _, pair) = stores();
        let steps = WorkflowCatalog::resolve(&request("sync_engagement", json!({})), &pair)
            .await
            .unwrap();
        assert!(steps.is_empty());
    }

    #[tokio::test]
    async fn sync_engagement_rejects_zero_threshold() {
        let (_, _, pair) = stores();
        let err = WorkflowCatalog::resolve(
            &request("sync_engagement", json!({"min_engagement": 0})),
            &pair,
        )
        .await
        .unwrap_err();
        assert_matches!(err, DuplexError::InvalidParams(_));
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected() {
        let (_, _, pair) = stores();
        let err = WorkflowCatalog::resolve(&request("drop_tables", json!({})), &pair)
            .await
            .unwrap_err();
        assert_matches!(err, DuplexError::UnknownWorkflow(_));
        assert!(!WorkflowCatalog::contains("drop_tables"));
        assert!(WorkflowCatalog::contains("register_user"));
    }
}
