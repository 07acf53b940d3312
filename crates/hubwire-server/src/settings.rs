//! Hub options loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HubOptions::default()`]
//! 2. If an options file is given and exists, deep-merge its values over defaults
//! 3. Apply `HUBWIRE_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{GroupStoreKind, HubOptions};
use crate::errors::SettingsError;

/// Env var toggling server heartbeats.
pub const ENV_HEARTBEAT_ENABLED: &str = "HUBWIRE_HEARTBEAT_ENABLED";
/// Env var for the heartbeat interval in milliseconds.
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "HUBWIRE_HEARTBEAT_INTERVAL_MS";
/// Env var for the heartbeat timeout in milliseconds (`0` = infinite).
pub const ENV_HEARTBEAT_TIMEOUT_MS: &str = "HUBWIRE_HEARTBEAT_TIMEOUT_MS";
/// Env var toggling error detail in error frames.
pub const ENV_RETURN_ERROR_DETAIL: &str = "HUBWIRE_RETURN_ERROR_DETAIL";
/// Env var for the client-result timeout in milliseconds (`0` = infinite).
pub const ENV_CLIENT_RESULT_TIMEOUT_MS: &str = "HUBWIRE_CLIENT_RESULT_TIMEOUT_MS";
/// Env var selecting the group store (`concurrent` or `snapshot`).
pub const ENV_GROUP_STORE: &str = "HUBWIRE_GROUP_STORE";

/// Load options from an optional file with env var overrides.
pub fn load_options(path: Option<&Path>) -> Result<HubOptions, SettingsError> {
    let mut options = match path {
        Some(path) => load_file(path)?,
        None => HubOptions::default(),
    };
    apply_env_overrides(&mut options);
    validate(&options)?;
    Ok(options)
}

/// Load options from a file without env var overrides.
///
/// A missing file yields defaults; malformed JSON is an error.
pub fn load_file(path: &Path) -> Result<HubOptions, SettingsError> {
    let defaults = serde_json::to_value(HubOptions::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading hub options from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "options file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
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

/// Apply process environment overrides.
pub fn apply_env_overrides(options: &mut HubOptions) {
    apply_overrides_from(options, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are ignored with a warning.
pub fn apply_overrides_from(options: &mut HubOptions, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = read_with(&lookup, ENV_HEARTBEAT_ENABLED, parse_bool) {
        options.heartbeat.enabled = v;
    }
    if let Some(v) = read_with(&lookup, ENV_HEARTBEAT_INTERVAL_MS, |s| parse_u64_range(s, 10, 3_600_000)) {
        options.heartbeat.interval_ms = v;
    }
    if let Some(v) = read_with(&lookup, ENV_HEARTBEAT_TIMEOUT_MS, |s| parse_u64_range(s, 0, 3_600_000)) {
        options.heartbeat.timeout_ms = Some(v);
    }
    if let Some(v) = read_with(&lookup, ENV_RETURN_ERROR_DETAIL, parse_bool) {
        options.return_error_detail = v;
    }
    if let Some(v) = read_with(&lookup, ENV_CLIENT_RESULT_TIMEOUT_MS, |s| parse_u64_range(s, 0, 3_600_000)) {
        options.client_result_timeout_ms = Some(v);
    }
    if let Some(v) = read_with(&lookup, ENV_GROUP_STORE, parse_group_store) {
        options.group_store = v;
    }
}

fn validate(options: &HubOptions) -> Result<(), SettingsError> {
    if options.outbound_queue_capacity == 0 {
        return Err(SettingsError::InvalidValue("outbound_queue_capacity must be positive".into()));
    }
    if options.request_queue_capacity == 0 {
        return Err(SettingsError::InvalidValue("request_queue_capacity must be positive".into()));
    }
    if options.heartbeat.interval_ms == 0 {
        return Err(SettingsError::InvalidValue("heartbeat.interval_ms must be positive".into()));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a group store name.
pub fn parse_group_store(val: &str) -> Option<GroupStoreKind> {
    match val.to_lowercase().as_str() {
        "concurrent" => Some(GroupStoreKind::Concurrent),
        "snapshot" | "immutable" => Some(GroupStoreKind::Snapshot),
        _ => None,
    }
}

fn read_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = lookup(name).filter(|v| !v.is_empty())?;
    let result = parse(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}
