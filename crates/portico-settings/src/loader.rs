//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PorticoSettings::default()`]
//! 2. If `~/.portico/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `PORTICO_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{AuthSchemeSetting, LogLevel, PorticoSettings};

/// Resolve the path to the settings file (`~/.portico/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".portico").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PorticoSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or values that fail
/// [`PorticoSettings::validate`] are errors.
pub fn load_settings_from_path(path: &Path) -> Result<PorticoSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// File and defaults only, no environment.
pub fn read_settings_file(path: &Path) -> Result<PorticoSettings> {
    let defaults = serde_json::to_value(PorticoSettings::default())?;

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
/// Invalid values are warned about and ignored (file/default wins).
pub fn apply_env_overrides(settings: &mut PorticoSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable variable source.
pub fn apply_overrides<F>(settings: &mut PorticoSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };
    let server = &mut settings.server;

    if let Some(v) = env.string("PORTICO_HOST") {
        server.host = v;
    }
    if let Some(v) = env.u16("PORTICO_PORT", 0, 65535) {
        server.port = v;
    }
    if let Some(v) = env.bool("PORTICO_SECURE") {
        server.secure = v;
    }
    if let Some(v) = env.string("PORTICO_CERT") {
        server.certificate_path = Some(v);
    }
    if let Some(v) = env.string("PORTICO_KEY") {
        server.private_key_path = Some(v);
    }
    if let Some(v) = env.bool("PORTICO_KEEP_CLEAN") {
        server.keep_clean = v;
    }
    if let Some(v) = env.u64("PORTICO_WAIT_TIME_MS", 1, 600_000) {
        server.wait_time_ms = v;
    }
    if let Some(v) = env.u64("PORTICO_SWEEP_INTERVAL_MS", 10, 86_400_000) {
        server.sweep_interval_ms = v;
    }
    if let Some(v) = env.string("PORTICO_AUTH_SCHEME") {
        match AuthSchemeSetting::parse(&v) {
            Some(scheme) => server.auth_scheme = scheme,
            None => tracing::warn!(key = "PORTICO_AUTH_SCHEME", value = %v, "unknown auth scheme, ignoring"),
        }
    }
    if let Some(v) = env.string("PORTICO_LOG_LEVEL") {
        match LogLevel::parse(&v) {
            Some(level) => settings.logging.level = level,
            None => tracing::warn!(key = "PORTICO_LOG_LEVEL", value = %v, "unknown log level, ignoring"),
        }
    }
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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}
