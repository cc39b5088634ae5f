//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BeaconSettings::default()`]
//! 2. If `~/.beacon/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `BEACON_*` environment overrides (highest priority)
//! 4. Validate the result

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{BeaconSettings, DuplicatePolicy};

/// Upper bound accepted for queue capacities coming from the environment.
const MAX_BUFFER: usize = 65_536;

/// Resolve the path to the settings file (`~/.beacon/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".beacon").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BeaconSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an unusable value is an
/// error.
pub fn load_settings_from_path(path: &Path) -> Result<BeaconSettings> {
    let mut settings = read_file_layer(path)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<BeaconSettings> {
    let defaults = serde_json::to_value(BeaconSettings::default())?;

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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `BEACON_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_overrides<F>(settings: &mut BeaconSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(val) = read("BEACON_MESSAGE_BUFFER") {
        match parse_usize_range(&val, 1, MAX_BUFFER) {
            Some(n) => settings.registry.message_buffer = n,
            None => warn!(key = "BEACON_MESSAGE_BUFFER", value = %val, "invalid buffer size, ignoring"),
        }
    }
    if let Some(val) = read("BEACON_REQUEST_BUFFER") {
        match parse_usize_range(&val, 1, MAX_BUFFER) {
            Some(n) => settings.registry.request_buffer = n,
            None => warn!(key = "BEACON_REQUEST_BUFFER", value = %val, "invalid buffer size, ignoring"),
        }
    }
    if let Some(val) = read("BEACON_DUPLICATE_POLICY") {
        match DuplicatePolicy::parse(&val) {
            Some(policy) => settings.registry.duplicate_policy = policy,
            None => warn!(key = "BEACON_DUPLICATE_POLICY", value = %val, "unknown duplicate policy, ignoring"),
        }
    }
    if let Some(val) = read("BEACON_LOG_LEVEL") {
        settings.logging.level = val;
    }
    if let Some(val) = read("BEACON_LOG_JSON") {
        match parse_bool(&val) {
            Some(b) => settings.logging.json = b,
            None => warn!(key = "BEACON_LOG_JSON", value = %val, "invalid boolean env var, ignoring"),
        }
    }
}

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

/// Parse a string as a `usize` within an inclusive range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}
