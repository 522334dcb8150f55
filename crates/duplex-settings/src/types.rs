//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with production values. Types carry `#[serde(default)]` so
//! partial JSON works; missing fields get their default value during
//! deserialization.

use duplex_core::retry::RetryConfig;
use serde::{Deserialize, Serialize};

/// Root settings type for the Duplex engine.
///
/// Loaded from `~/.duplex/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values.
///
/// # JSON Format
///
/// All field names are camelCase. Example:
///
/// ```json
/// {
///   "oplog": { "path": "/var/lib/duplex/oplog.db" },
///   "retry": { "maxAttempts": 3 },
///   "reconciler": { "gracePeriodSecs": 10 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DuplexSettings {
    /// Operation log storage settings.
    pub oplog: OpLogSettings,
    /// Retry policy for transient store failures.
    pub retry: RetryConfig,
    /// Reconciliation sweep settings.
    pub reconciler: ReconcilerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Operation log storage settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpLogSettings {
    /// Path to the `SQLite` database file.
    pub path: String,
    /// Maximum connection pool size.
    pub pool_size: u32,
    /// `SQLite` busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for OpLogSettings {
    fn default() -> Self {
        Self {
            path: default_oplog_path(),
            pool_size: 8,
            busy_timeout_ms: 30_000,
        }
    }
}

fn default_oplog_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{home}/.duplex/oplog.db")
}

/// Reconciliation sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerSettings {
    /// Records younger than this are skipped by a sweep. Absorbs in-flight
    /// workflows that have written one side but not yet the other.
    pub grace_period_secs: u64,
    /// Cross-store target pairs a sweep compares.
    pub pairs: Vec<ReconcilerPair>,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
            pairs: Vec::new(),
        }
    }
}

/// One cross-store pairing: a relational target whose rows should each have
/// a shadowing document, plus the workflow that recreates a missing document
/// during healing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerPair {
    /// Relational table holding the authoritative rows.
    pub primary_target: String,
    /// Document collection expected to shadow each row.
    pub secondary_target: String,
    /// Catalog workflow that recreates a missing document.
    #[serde(default = "default_heal_workflow")]
    pub heal_workflow: String,
}

fn default_heal_workflow() -> String {
    "restore_shadow".to_string()
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
