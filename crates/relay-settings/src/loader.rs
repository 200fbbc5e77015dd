//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::RelaySettings;

/// Resolve the default settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning, falling back to file/default.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let number = |name: &str, min: u64, max: u64| {
        let val = string(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(v) = string("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = number("RELAY_PORT", 1, 65535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = string("RELAY_BACKEND_URL") {
        settings.backend.base_url = v;
    }
    if let Some(v) = number("RELAY_BACKEND_TIMEOUT_SECS", 1, 600) {
        settings.backend.timeout_secs = v;
    }
    if let Some(v) = string("RELAY_ENGINE_URL") {
        settings.engine.base_url = v;
    }
    if let Some(v) = string("RELAY_SESSIONS_DIR") {
        settings.sessions.root = PathBuf::from(v);
    }
    if let Some(v) = number("RELAY_CLEANUP_MAX_RETRIES", 0, 100) {
        settings.sessions.cleanup_max_retries = v as u32;
    }
    if let Some(v) = number("RELAY_CLEANUP_DELAY_MS", 0, 600_000) {
        settings.sessions.cleanup_delay_ms = v;
    }
    if let Some(v) = string("RELAY_LOG_LEVEL") {
        settings.logging.level = v.to_lowercase();
    }
    if let Some(val) = string("RELAY_LOG_TO_SQLITE") {
        match parse_bool(&val) {
            Some(v) => settings.logging.log_to_sqlite = v,
            None => tracing::warn!(key = "RELAY_LOG_TO_SQLITE", value = %val, "invalid boolean env var, ignoring"),
        }
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
