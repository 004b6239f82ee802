//! Reads `settings.json` over the compiled defaults and applies `PRISM_*`
//! environment overrides.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{LogFormat, PrismSettings};

/// `~/.prism/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".prism").join("settings.json")
}

pub fn load_settings() -> Result<PrismSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or out-of-range values are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<PrismSettings> {
    let defaults = serde_json::to_value(PrismSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: PrismSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Overlay `source` onto `target`. Objects merge key by key, `null` in
/// `source` keeps the target value, anything else replaces it.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut merged), Value::Object(overlay)) => {
            for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
                let next = match merged.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                merged.insert(key, next);
            }
            Value::Object(merged)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut PrismSettings) {
    apply_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Invalid values are logged and
/// ignored, leaving the file/default value in place.
pub fn apply_overrides_with<F>(settings: &mut PrismSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = read_u64(&lookup, "PRISM_REQUEST_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.engine.request_timeout_ms = v;
    }
    if let Some(v) = read_u64(&lookup, "PRISM_INTERRUPT_GRACE_MS", 0, 600_000) {
        settings.engine.interrupt_grace_ms = v;
    }
    if let Some(v) = read_string(&lookup, "PRISM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_string(&lookup, "PRISM_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "PRISM_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn read_string<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.is_empty())
}

fn read_u64<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, min: u64, max: u64) -> Option<u64> {
    let val = lookup(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
