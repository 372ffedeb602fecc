//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CircularSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `CIRCULAR_*` environment variable overrides (highest priority)
//! 4. Run [`CircularSettings::validate`]

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{circular_home, CircularSettings, StorageMode};

/// `CIRCULAR_SETTINGS` if set, else `~/.circular/settings.json`.
pub fn settings_path() -> PathBuf {
    match std::env::var("CIRCULAR_SETTINGS") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => circular_home().join("settings.json"),
    }
}

pub fn load_settings() -> Result<CircularSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a file that fails
/// validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CircularSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

fn load_with_env<F>(path: &Path, env: F) -> Result<CircularSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(CircularSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CircularSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced by `source`, and
/// nulls in `source` are skipped.
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

fn apply_overrides<F>(settings: &mut CircularSettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let reader = EnvReader { env };

    // ── Database ────────────────────────────────────────────────────
    if let Some(v) = reader.string("CIRCULAR_DB_PATH") {
        settings.database.path = v;
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = reader.string("CIRCULAR_STORAGE_MODE") {
        match v.to_lowercase().as_str() {
            "local" => settings.storage.mode = StorageMode::Local,
            "remote" => settings.storage.mode = StorageMode::Remote,
            _ => warn!(key = "CIRCULAR_STORAGE_MODE", value = %v, "invalid storage mode, ignoring"),
        }
    }
    if let Some(v) = reader.string("CIRCULAR_LOCAL_ROOT") {
        settings.storage.local_root = v;
    }
    if let Some(v) = reader.string("CIRCULAR_PUBLIC_BASE_URL") {
        settings.storage.public_base_url = v;
    }
    if let Some(v) = reader.string("CIRCULAR_STAGING_DIR") {
        settings.storage.staging_dir = v;
    }
    if let Some(v) = reader.string("CIRCULAR_REMOTE_ENDPOINT") {
        settings.storage.remote.endpoint = v;
    }
    if let Some(v) = reader.string("CIRCULAR_REMOTE_BUCKET") {
        settings.storage.remote.bucket = v;
    }

    // ── Rendering ───────────────────────────────────────────────────
    if let Some(v) = reader.string("CIRCULAR_TEMPLATE_PATH") {
        settings.rendering.template_path = Some(v);
    }
    if let Some(v) = reader.string("CIRCULAR_SIGNATURE_FIELD") {
        settings.rendering.signature_field = v;
    }
    if let Some(v) = reader.u64("CIRCULAR_RENDER_TIMEOUT_MS", 100, 600_000) {
        settings.rendering.render_timeout_ms = v;
    }

    // ── Engine ──────────────────────────────────────────────────────
    if let Some(v) = reader.u64("CIRCULAR_PERSIST_TIMEOUT_MS", 100, 600_000) {
        settings.engine.persist_timeout_ms = v;
    }
    if let Some(v) = reader.u64("CIRCULAR_MAX_SUBMIT_ATTEMPTS", 1, 10) {
        settings.engine.max_submit_attempts = v as u32;
    }
    if let Some(v) = reader.u64("CIRCULAR_SUBMIT_BACKOFF_MS", 0, 10_000) {
        settings.engine.submit_backoff_ms = v;
    }
    if let Some(v) = reader.u64("CIRCULAR_RETRY_MIN_AGE_SECS", 0, 86_400) {
        settings.engine.retry_min_age_secs = v;
    }

    // ── Telemetry ───────────────────────────────────────────────────
    if let Some(v) = reader.string("CIRCULAR_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = reader.bool("CIRCULAR_LOG_TO_SQLITE") {
        settings.telemetry.log_to_sqlite = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    env: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.env)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.env)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid integer env var, ignoring");
        }
        result
    }
}
