//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DuplexSettings::default()`]
//! 2. If `~/.duplex/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::DuplexSettings;

/// Resolve the path to the settings file (`~/.duplex/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".duplex").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DuplexSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<DuplexSettings> {
    let defaults = serde_json::to_value(DuplexSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DuplexSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Each env var has strict parsing rules: integers must be valid and within
/// the specified range. Invalid values are silently ignored (fall back to
/// file/default).
pub fn apply_env_overrides(settings: &mut DuplexSettings) {
    // ── Operation log ───────────────────────────────────────────────
    if let Some(v) = read_env_string("DUPLEX_OPLOG_PATH") {
        settings.oplog.path = v;
    }
    if let Some(v) = read_env_u32("DUPLEX_OPLOG_POOL_SIZE", 1, 64) {
        settings.oplog.pool_size = v;
    }
    if let Some(v) = read_env_u32("DUPLEX_OPLOG_BUSY_TIMEOUT_MS", 100, 600_000) {
        settings.oplog.busy_timeout_ms = v;
    }

    // ── Retry policy ────────────────────────────────────────────────
    if let Some(v) = read_env_u32("DUPLEX_MAX_ATTEMPTS", 1, 10) {
        settings.retry.max_attempts = v;
    }
    if let Some(v) = read_env_u64("DUPLEX_BASE_DELAY_MS", 1, 60_000) {
        settings.retry.base_delay_ms = v;
    }
    if let Some(v) = read_env_u64("DUPLEX_MAX_DELAY_MS", 1, 600_000) {
        settings.retry.max_delay_ms = v;
    }

    // ── Reconciler ──────────────────────────────────────────────────
    if let Some(v) = read_env_u64("DUPLEX_GRACE_PERIOD_SECS", 0, 86_400) {
        settings.reconciler.grace_period_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("DUPLEX_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_simple_override() {
        let target = json!({"a": 1, "b": 2});
        let source = json!({"b": 3});
        assert_eq!(deep_merge(target, source), json!({"a": 1, "b": 3}));
    }

    #[test]
    fn merge_nested_objects() {
        let target = json!({"oplog": {"poolSize": 8, "busyTimeoutMs": 30000}});
        let source = json!({"oplog": {"poolSize": 2}});
        assert_eq!(
            deep_merge(target, source),
            json!({"oplog": {"poolSize": 2, "busyTimeoutMs": 30000}})
        );
    }

    #[test]
    fn merge_skips_null_source_values() {
        let target = json!({"a": 1});
        let source = json!({"a": null, "b": 2});
        assert_eq!(deep_merge(target, source), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_replaces_arrays_entirely() {
        let target = json!({"pairs": [{"primaryTarget": "users"}]});
        let source = json!({"pairs": []});
        assert_eq!(deep_merge(target, source), json!({"pairs": []}));
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_u32_enforces_range() {
        assert_eq!(parse_u32_range("5", 1, 10), Some(5));
        assert_eq!(parse_u32_range("0", 1, 10), None);
        assert_eq!(parse_u32_range("11", 1, 10), None);
        assert_eq!(parse_u32_range("nope", 1, 10), None);
    }

    #[test]
    fn parse_u64_enforces_range() {
        assert_eq!(parse_u64_range("100", 1, 60_000), Some(100));
        assert_eq!(parse_u64_range("60001", 1, 60_000), None);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.reconciler.grace_period_secs, 10);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
              "oplog": {"path": "/data/oplog.db"},
              "reconciler": {
                "gracePeriodSecs": 5,
                "pairs": [{
                  "primaryTarget": "users",
                  "secondaryTarget": "user_activities"
                }]
              }
            }"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.oplog.path, "/data/oplog.db");
        assert_eq!(settings.oplog.pool_size, 8, "unset fields keep defaults");
        assert_eq!(settings.reconciler.grace_period_secs, 5);
        assert_eq!(settings.reconciler.pairs.len(), 1);
        assert_eq!(settings.reconciler.pairs[0].heal_workflow, "restore_shadow");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_settings_from_path(&path).is_err());
    }
}
