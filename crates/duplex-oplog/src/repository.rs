//! Operation log repository.
//!
//! The log is append-only: a step's lifecycle is a sequence of rows sharing
//! `(workflow_key, step_index)`, never an update of an earlier row. This
//! repository provides the low-level append and the queries the coordinator,
//! recovery scan, and status reporting are built on.
//!
//! Stateless; every method takes `&Connection`.

use rusqlite::{params, Connection, OptionalExtension};

use chrono::{DateTime, Utc};
use duplex_core::ids::{EntryId, StoreRef, WorkflowKey};
use duplex_core::workflow::{EntryStatus, OpLogEntry, StoreKind, WorkflowRequest};

use crate::errors::{OpLogError, Result};

const SELECT_COLUMNS: &str =
    "id, workflow_key, step_index, store, status, reference, detail, created_at";

/// Operation log repository.
pub struct OpLogRepo;

impl OpLogRepo {
    /// Append one entry. Never updates an existing row.
    ///
    /// The partial unique index on committed rows turns a duplicate commit of
    /// the same step into a constraint violation here.
    pub fn append(conn: &Connection, entry: &OpLogEntry) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO op_log (id, workflow_key, step_index, store, status, reference, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id.as_str(),
                entry.key.as_str(),
                entry.step_index,
                entry.store.as_str(),
                entry.status.as_str(),
                entry.reference.as_ref().map(|r| r.as_str().to_owned()),
                entry.detail,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Latest entry for one `(workflow_key, step_index)` pair, if any.
    ///
    /// Entry ids are time-ordered, so `(created_at, id)` gives a total order
    /// even when two rows share a timestamp.
    pub fn latest_for_step(
        conn: &Connection,
        key: &WorkflowKey,
        step_index: u32,
    ) -> Result<Option<OpLogEntry>> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM op_log
                     WHERE workflow_key = ?1 AND step_index = ?2
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![key.as_str(), step_index],
                Self::map_row,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    /// The committed entry for one `(workflow_key, step_index)` pair, if any.
    pub fn committed_for_step(
        conn: &Connection,
        key: &WorkflowKey,
        step_index: u32,
    ) -> Result<Option<OpLogEntry>> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM op_log
                     WHERE workflow_key = ?1 AND step_index = ?2 AND status = 'committed'"
                ),
                params![key.as_str(), step_index],
                Self::map_row,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    /// All entries for one workflow key in append order.
    pub fn list_by_key(conn: &Connection, key: &WorkflowKey) -> Result<Vec<OpLogEntry>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM op_log
             WHERE workflow_key = ?1
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![key.as_str()], Self::map_row)?;
        let mut entries = Vec::new();
        for raw in rows {
            entries.push(decode(raw?)?);
        }
        Ok(entries)
    }

    /// Workflow keys with at least one unresolved pending step.
    ///
    /// A step is unresolved while it has a pending row and no later
    /// committed/compensated/failed row. These are the candidates the
    /// recovery scan replays after a crash.
    pub fn pending_keys(conn: &Connection) -> Result<Vec<WorkflowKey>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT o.workflow_key FROM op_log o
             WHERE o.status = 'pending'
               AND NOT EXISTS (
                 SELECT 1 FROM op_log l
                 WHERE l.workflow_key = o.workflow_key
                   AND l.step_index = o.step_index
                   AND l.status <> 'pending'
               )
             ORDER BY o.workflow_key",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(WorkflowKey::from(key?));
        }
        Ok(keys)
    }

    /// Record the request behind a workflow key. A resubmission of the same
    /// key leaves the original row untouched.
    pub fn record_request(conn: &Connection, request: &WorkflowRequest) -> Result<()> {
        let _ = conn.execute(
            "INSERT OR IGNORE INTO workflow_requests (workflow_key, workflow, params, created_at)
             VALUES (?1, ?2, ?3, datetime('now'))",
            params![
                request.key.as_str(),
                request.workflow,
                serde_json::to_string(&request.params)?,
            ],
        )?;
        Ok(())
    }

    /// Mark a workflow key's request row terminal with the number of steps
    /// that committed. Idempotent: re-marking writes the same value.
    pub fn mark_request_completed(
        conn: &Connection,
        key: &WorkflowKey,
        step_count: u32,
    ) -> Result<()> {
        let updated = conn.execute(
            "UPDATE workflow_requests SET completed_steps = ?1 WHERE workflow_key = ?2",
            params![step_count, key.as_str()],
        )?;
        if updated == 0 {
            return Err(OpLogError::Internal(format!(
                "no request row to complete for key '{key}'"
            )));
        }
        Ok(())
    }

    /// Number of steps a completed workflow committed, or `None` while the
    /// key has not reached Completed.
    pub fn completed_step_count(conn: &Connection, key: &WorkflowKey) -> Result<Option<u32>> {
        let raw = conn
            .query_row(
                "SELECT completed_steps FROM workflow_requests WHERE workflow_key = ?1",
                params![key.as_str()],
                |row| row.get::<_, Option<u32>>(0),
            )
            .optional()?;
        Ok(raw.flatten())
    }

    /// Workflow keys whose unwind was cut short.
    ///
    /// A key qualifies when it carries a failed row and some step's only
    /// resolution is still `committed`: the process died between logging the
    /// failure and compensating every committed step. The recovery scan
    /// resumes the unwind for these.
    pub fn compensation_pending_keys(conn: &Connection) -> Result<Vec<WorkflowKey>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT f.workflow_key FROM op_log f
             WHERE f.status = 'failed'
               AND EXISTS (
                 SELECT 1 FROM op_log c
                 WHERE c.workflow_key = f.workflow_key
                   AND c.status = 'committed'
                   AND NOT EXISTS (
                     SELECT 1 FROM op_log l
                     WHERE l.workflow_key = c.workflow_key
                       AND l.step_index = c.step_index
                       AND l.status IN ('compensated', 'failed')
                   )
               )
             ORDER BY f.workflow_key",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(WorkflowKey::from(key?));
        }
        Ok(keys)
    }

    /// Load the recorded request for a workflow key, if any.
    pub fn get_request(conn: &Connection, key: &WorkflowKey) -> Result<Option<WorkflowRequest>> {
        let raw = conn
            .query_row(
                "SELECT workflow, params FROM workflow_requests WHERE workflow_key = ?1",
                params![key.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        raw.map(|(workflow, params)| {
            Ok(WorkflowRequest {
                key: key.clone(),
                workflow,
                params: serde_json::from_str(&params)?,
            })
        })
        .transpose()
    }

    /// Total number of log rows.
    pub fn count(conn: &Connection) -> Result<i64> {
        let n = conn.query_row("SELECT COUNT(*) FROM op_log", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Number of log rows with a given status.
    pub fn count_by_status(conn: &Connection, status: EntryStatus) -> Result<i64> {
        let n = conn.query_row(
            "SELECT COUNT(*) FROM op_log WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            id: row.get(0)?,
            key: row.get(1)?,
            step_index: row.get(2)?,
            store: row.get(3)?,
            status: row.get(4)?,
            reference: row.get(5)?,
            detail: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

struct RawRow {
    id: String,
    key: String,
    step_index: u32,
    store: String,
    status: String,
    reference: Option<String>,
    detail: Option<String>,
    created_at: String,
}

fn decode(raw: RawRow) -> Result<OpLogEntry> {
    let store = StoreKind::parse(&raw.store)
        .ok_or_else(|| OpLogError::CorruptEntry(format!("unknown store '{}'", raw.store)))?;
    let status = EntryStatus::parse(&raw.status)
        .ok_or_else(|| OpLogError::CorruptEntry(format!("unknown status '{}'", raw.status)))?;
    let created_at = DateTime::parse_from_rfc3339(&raw.created_at)
        .map_err(|e| OpLogError::CorruptEntry(format!("bad created_at '{}': {e}", raw.created_at)))?
        .with_timezone(&Utc);
    Ok(OpLogEntry {
        id: EntryId::from(raw.id),
        key: WorkflowKey::from(raw.key),
        step_index: raw.step_index,
        store,
        status,
        reference: raw.reference.map(StoreRef::from),
        detail: raw.detail,
        created_at,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    fn entry(key: &str, step: u32, status: EntryStatus, reference: Option<&str>) -> OpLogEntry {
        OpLogEntry {
            id: EntryId::new(),
            key: WorkflowKey::from(key),
            step_index: step,
            store: StoreKind::Relational,
            status,
            reference: reference.map(StoreRef::from),
            detail: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn append_then_list_preserves_order() {
        let conn = open();
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Pending, None)).unwrap();
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Committed, Some("42"))).unwrap();
        OpLogRepo::append(&conn, &entry("wf-1", 1, EntryStatus::Pending, None)).unwrap();

        let entries = OpLogRepo::list_by_key(&conn, &WorkflowKey::from("wf-1")).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].status, EntryStatus::Pending);
        assert_eq!(entries[1].status, EntryStatus::Committed);
        assert_eq!(entries[1].reference.as_deref(), Some("42"));
        assert_eq!(entries[2].step_index, 1);
    }

    #[test]
    fn latest_for_step_reflects_lifecycle() {
        let conn = open();
        let key = WorkflowKey::from("wf-1");
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Pending, None)).unwrap();
        let latest = OpLogRepo::latest_for_step(&conn, &key, 0).unwrap().unwrap();
        assert_eq!(latest.status, EntryStatus::Pending);

        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Committed, Some("7"))).unwrap();
        let latest = OpLogRepo::latest_for_step(&conn, &key, 0).unwrap().unwrap();
        assert_eq!(latest.status, EntryStatus::Committed);

        assert!(OpLogRepo::latest_for_step(&conn, &key, 5).unwrap().is_none());
    }

    #[test]
    fn committed_for_step_ignores_other_rows() {
        let conn = open();
        let key = WorkflowKey::from("wf-1");
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Pending, None)).unwrap();
        assert!(OpLogRepo::committed_for_step(&conn, &key, 0).unwrap().is_none());
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Committed, Some("9"))).unwrap();
        let committed = OpLogRepo::committed_for_step(&conn, &key, 0).unwrap().unwrap();
        assert_eq!(committed.reference.as_deref(), Some("9"));
    }

    #[test]
    fn duplicate_commit_is_rejected() {
        let conn = open();
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Committed, Some("1"))).unwrap();
        let err = OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Committed, Some("2")));
        assert!(matches!(err, Err(OpLogError::Sqlite(_))));
    }

    #[test]
    fn pending_keys_skips_resolved_steps() {
        let conn = open();
        // wf-1 step 0 resolved, wf-2 step 0 still pending.
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Pending, None)).unwrap();
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Committed, Some("1"))).unwrap();
        OpLogRepo::append(&conn, &entry("wf-2", 0, EntryStatus::Pending, None)).unwrap();

        let keys = OpLogRepo::pending_keys(&conn).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].as_str(), "wf-2");
    }

    #[test]
    fn request_recorded_once_per_key() {
        let conn = open();
        let key = WorkflowKey::from("wf-1");
        let request = WorkflowRequest {
            key: key.clone(),
            workflow: "register_user".into(),
            params: serde_json::json!({"username": "ada"}),
        };
        OpLogRepo::record_request(&conn, &request).unwrap();

        // Resubmission with different params keeps the original row.
        let resubmit = WorkflowRequest {
            key: key.clone(),
            workflow: "register_user".into(),
            params: serde_json::json!({"username": "edited"}),
        };
        OpLogRepo::record_request(&conn, &resubmit).unwrap();

        let loaded = OpLogRepo::get_request(&conn, &key).unwrap().unwrap();
        assert_eq!(loaded.workflow, "register_user");
        assert_eq!(loaded.params["username"], "ada");

        assert!(OpLogRepo::get_request(&conn, &WorkflowKey::from("wf-2"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn completed_marker_round_trips() {
        let conn = open();
        let key = WorkflowKey::from("wf-1");
        let request = WorkflowRequest {
            key: key.clone(),
            workflow: "register_user".into(),
            params: serde_json::json!({}),
        };
        OpLogRepo::record_request(&conn, &request).unwrap();
        assert!(OpLogRepo::completed_step_count(&conn, &key).unwrap().is_none());

        OpLogRepo::mark_request_completed(&conn, &key, 3).unwrap();
        assert_eq!(OpLogRepo::completed_step_count(&conn, &key).unwrap(), Some(3));

        // Marking a key with no request row is a coordinator bug.
        let err = OpLogRepo::mark_request_completed(&conn, &WorkflowKey::from("wf-2"), 1);
        assert!(matches!(err, Err(OpLogError::Internal(_))));
    }

    #[test]
    fn compensation_pending_keys_finds_cut_short_unwinds() {
        let conn = open();
        // wf-1: steps 0,1 committed, step 2 failed, step 1 compensated,
        // step 0 still dangling.
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Committed, Some("1"))).unwrap();
        OpLogRepo::append(&conn, &entry("wf-1", 1, EntryStatus::Committed, Some("2"))).unwrap();
        OpLogRepo::append(&conn, &entry("wf-1", 2, EntryStatus::Failed, None)).unwrap();
        OpLogRepo::append(&conn, &entry("wf-1", 1, EntryStatus::Compensated, Some("2"))).unwrap();
        // wf-2: fully unwound.
        OpLogRepo::append(&conn, &entry("wf-2", 0, EntryStatus::Committed, Some("3"))).unwrap();
        OpLogRepo::append(&conn, &entry("wf-2", 1, EntryStatus::Failed, None)).unwrap();
        OpLogRepo::append(&conn, &entry("wf-2", 0, EntryStatus::Compensated, Some("3"))).unwrap();
        // wf-3: completed, no failure.
        OpLogRepo::append(&conn, &entry("wf-3", 0, EntryStatus::Committed, Some("4"))).unwrap();

        let keys = OpLogRepo::compensation_pending_keys(&conn).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].as_str(), "wf-1");
    }

    #[test]
    fn counts_by_status() {
        let conn = open();
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Pending, None)).unwrap();
        OpLogRepo::append(&conn, &entry("wf-1", 0, EntryStatus::Failed, None)).unwrap();
        assert_eq!(OpLogRepo::count(&conn).unwrap(), 2);
        assert_eq!(OpLogRepo::count_by_status(&conn, EntryStatus::Failed).unwrap(), 1);
        assert_eq!(OpLogRepo::count_by_status(&conn, EntryStatus::Committed).unwrap(), 0);
    }
}
