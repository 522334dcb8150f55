//! Operation log facade.
//!
//! [`OperationLog`] owns the connection pool and runs migrations on open. It
//! is the only type the engine talks to; the repository stays an internal
//! layer. Appends are synchronous and durable before they return, which is
//! what makes the write-ahead contract hold: a pending row reaches the disk
//! before the store write it describes is attempted.

use chrono::Utc;
use tracing::info;

use duplex_core::ids::{EntryId, StoreRef, WorkflowKey};
use duplex_core::workflow::{EntryStatus, OpLogEntry, StoreKind, WorkflowRequest};

use crate::connection::{self, ConnectionConfig, ConnectionPool};
use crate::errors::Result;
use crate::migrations::run_migrations;
use crate::repository::OpLogRepo;

/// Durable operation log backed by `SQLite`.
pub struct OperationLog {
    pool: ConnectionPool,
}

impl OperationLog {
    /// Open an in-memory log (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = connection::new_in_memory(&ConnectionConfig::default())?;
        Self::from_pool(pool)
    }

    /// Open (or create) a file-backed log at the given path.
    pub fn open(path: &str, config: &ConnectionConfig) -> Result<Self> {
        let pool = connection::new_file(path, config)?;
        let log = Self::from_pool(pool)?;
        info!(path, "operation log open");
        Ok(log)
    }

    fn from_pool(pool: ConnectionPool) -> Result<Self> {
        let conn = pool.get()?;
        let _ = run_migrations(&conn)?;
        drop(conn);
        Ok(Self { pool })
    }

    /// Append a fully formed entry.
    pub fn append(&self, entry: &OpLogEntry) -> Result<()> {
        let conn = self.pool.get()?;
        OpLogRepo::append(&conn, entry)
    }

    /// Build and append one lifecycle row for a step, returning the entry.
    pub fn record(
        &self,
        key: &WorkflowKey,
        step_index: u32,
        store: StoreKind,
        status: EntryStatus,
        reference: Option<StoreRef>,
        detail: Option<String>,
    ) -> Result<OpLogEntry> {
        let entry = OpLogEntry {
            id: EntryId::new(),
            key: key.clone(),
            step_index,
            store,
            status,
            reference,
            detail,
            created_at: Utc::now(),
        };
        self.append(&entry)?;
        Ok(entry)
    }

    /// Latest entry for one `(workflow_key, step_index)` pair, if any.
    pub fn latest_for_step(
        &self,
        key: &WorkflowKey,
        step_index: u32,
    ) -> Result<Option<OpLogEntry>> {
        let conn = self.pool.get()?;
        OpLogRepo::latest_for_step(&conn, key, step_index)
    }

    /// The committed entry for one `(workflow_key, step_index)` pair, if any.
    pub fn committed_for_step(
        &self,
        key: &WorkflowKey,
        step_index: u32,
    ) -> Result<Option<OpLogEntry>> {
        let conn = self.pool.get()?;
        OpLogRepo::committed_for_step(&conn, key, step_index)
    }

    /// All entries for one workflow key in append order.
    pub fn list_by_key(&self, key: &WorkflowKey) -> Result<Vec<OpLogEntry>> {
        let conn = self.pool.get()?;
        OpLogRepo::list_by_key(&conn, key)
    }

    /// Record the request behind a workflow key (first submission wins).
    pub fn record_request(&self, request: &WorkflowRequest) -> Result<()> {
        let conn = self.pool.get()?;
        OpLogRepo::record_request(&conn, request)
    }

    /// Load the recorded request for a workflow key, if any.
    pub fn get_request(&self, key: &WorkflowKey) -> Result<Option<WorkflowRequest>> {
        let conn = self.pool.get()?;
        OpLogRepo::get_request(&conn, key)
    }

    /// Mark a workflow key terminal with the number of steps that committed.
    pub fn mark_completed(&self, key: &WorkflowKey, step_count: u32) -> Result<()> {
        let conn = self.pool.get()?;
        OpLogRepo::mark_request_completed(&conn, key, step_count)
    }

    /// Number of steps a completed workflow committed, if the key is terminal.
    pub fn completed_step_count(&self, key: &WorkflowKey) -> Result<Option<u32>> {
        let conn = self.pool.get()?;
        OpLogRepo::completed_step_count(&conn, key)
    }

    /// Workflow keys with at least one unresolved pending step.
    pub fn pending_keys(&self) -> Result<Vec<WorkflowKey>> {
        let conn = self.pool.get()?;
        OpLogRepo::pending_keys(&conn)
    }

    /// Workflow keys whose unwind was cut short by a crash.
    pub fn compensation_pending_keys(&self) -> Result<Vec<WorkflowKey>> {
        let conn = self.pool.get()?;
        OpLogRepo::compensation_pending_keys(&conn)
    }

    /// Total number of log rows.
    pub fn count(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        OpLogRepo::count(&conn)
    }

    /// Number of log rows with a given status.
    pub fn count_by_status(&self, status: EntryStatus) -> Result<i64> {
        let conn = self.pool.get()?;
        OpLogRepo::count_by_status(&conn, status)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_one_row() {
        let log = OperationLog::in_memory().unwrap();
        let key = WorkflowKey::from("wf-1");
        let entry = log
            .record(&key, 0, StoreKind::Relational, EntryStatus::Pending, None, None)
            .unwrap();
        assert_eq!(entry.step_index, 0);
        assert_eq!(log.count().unwrap(), 1);
        let listed = log.list_by_key(&key).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, entry.id);
    }

    #[test]
    fn file_backed_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog.db");
        let path = path.to_str().unwrap();
        let key = WorkflowKey::from("wf-1");

        {
            let log = OperationLog::open(path, &ConnectionConfig::default()).unwrap();
            let _ = log
                .record(&key, 0, StoreKind::Document, EntryStatus::Pending, None, None)
                .unwrap();
        }

        let log = OperationLog::open(path, &ConnectionConfig::default()).unwrap();
        assert_eq!(log.count().unwrap(), 1);
        let pending = log.pending_keys().unwrap();
        assert_eq!(pending, vec![key]);
    }

    #[test]
    fn lifecycle_rows_accumulate() {
        let log = OperationLog::in_memory().unwrap();
        let key = WorkflowKey::from("wf-1");
        let _ = log
            .record(&key, 0, StoreKind::Relational, EntryStatus::Pending, None, None)
            .unwrap();
        let _ = log
            .record(
                &key,
                0,
                StoreKind::Relational,
                EntryStatus::Committed,
                Some(StoreRef::from("12")),
                None,
            )
            .unwrap();
        let latest = log.latest_for_step(&key, 0).unwrap().unwrap();
        assert_eq!(latest.status, EntryStatus::Committed);
        assert_eq!(latest.reference.as_deref(), Some("12"));
        assert!(log.pending_keys().unwrap().is_empty());
    }
}
