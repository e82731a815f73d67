//! Settings loading with deep merge, environment and host-page overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PixelSettings::default()`]
//! 2. If `~/.pixel/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `PIXEL_*` environment variable overrides
//! 4. Apply host-page data attributes (highest priority, see [`apply_script_attributes`])

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use pixel_core::deep_merge;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{PixelSettings, pixel_dir};

/// Upper bound for the session timeout, in minutes (one week).
const MAX_SESSION_TIMEOUT_MINUTES: u64 = 10_080;

/// Resolve the path to the settings file (`~/.pixel/settings.json`).
pub fn settings_path() -> PathBuf {
    pixel_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PixelSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<PixelSettings> {
    let defaults = serde_json::to_value(PixelSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: PixelSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Reject settings that leave the client without a collection URL.
pub fn validate(settings: &PixelSettings) -> Result<()> {
    let has_endpoint = settings
        .endpoint
        .as_deref()
        .is_some_and(|e| !e.trim().is_empty());
    if !has_endpoint && settings.api_base.trim().is_empty() {
        return Err(SettingsError::InvalidValue("apiBase is empty".into()));
    }
    if settings.session.timeout_minutes == 0 {
        return Err(SettingsError::InvalidValue(
            "session.timeoutMinutes must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Apply `PIXEL_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut PixelSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` (the environment in production).
///
/// Invalid values are ignored with a warning and the file/default value is
/// kept.
pub fn apply_overrides_from(settings: &mut PixelSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let number = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid numeric override, ignoring");
        }
        parsed
    };

    if let Some(v) = string("PIXEL_API_BASE") {
        settings.api_base = v;
    }
    if let Some(v) = string("PIXEL_ENDPOINT") {
        settings.endpoint = Some(v);
    }
    if let Some(v) = number("PIXEL_SESSION_TIMEOUT_MINUTES", 1, MAX_SESSION_TIMEOUT_MINUTES) {
        settings.session.timeout_minutes = v;
    }
    if let Some(v) = number("PIXEL_RETRY_BASE_DELAY_MS", 0, 600_000) {
        settings.delivery.retry.base_delay_ms = v;
    }
    if let Some(v) = number("PIXEL_MAX_ATTEMPTS", 0, u64::from(u32::MAX)) {
        settings.delivery.retry.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = number("PIXEL_REQUEST_TIMEOUT_MS", 100, 600_000) {
        settings.delivery.request_timeout_ms = Some(v);
    }
    if let Some(v) = string("PIXEL_STORAGE_PATH") {
        settings.storage.durable_path = Some(v);
    }
    if let Some(v) = string("PIXEL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = lookup("PIXEL_LOG_JSON") {
        match parse_bool(&v) {
            Some(json) => settings.logging.json = json,
            None => warn!(key = "PIXEL_LOG_JSON", value = %v, "invalid boolean override, ignoring"),
        }
    }
}

/// Apply the host page's script-tag data attributes.
///
/// Recognised keys (with or without the `data-` prefix):
/// - `api-base`: API base URL
/// - `endpoint`: full collection URL
/// - `session-timeout`: session inactivity timeout in minutes
pub fn apply_script_attributes(settings: &mut PixelSettings, attributes: &HashMap<String, String>) {
    for (raw_key, value) in attributes {
        let key = raw_key.strip_prefix("data-").unwrap_or(raw_key);
        let value = value.trim();
        match key {
            "api-base" if !value.is_empty() => settings.api_base = value.to_string(),
            "endpoint" if !value.is_empty() => settings.endpoint = Some(value.to_string()),
            "session-timeout" => {
                match parse_u64_range(value, 1, MAX_SESSION_TIMEOUT_MINUTES) {
                    Some(minutes) => settings.session.timeout_minutes = minutes,
                    None => warn!(value, "invalid data-session-timeout, ignoring"),
                }
            }
            _ => {}
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
