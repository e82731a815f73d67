//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may contain any subset of fields; missing ones take the compiled
//! default.

use std::path::PathBuf;
use std::time::Duration;

use pixel_core::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Path of the collection route relative to the API base.
pub const COLLECT_PATH: &str = "/api/pixel/collect";

/// Root settings type for the pixel client.
///
/// ```json
/// {
///   "apiBase": "https://api.example.test",
///   "session": { "timeoutMinutes": 45 },
///   "delivery": { "retry": { "baseDelayMs": 250, "maxAttempts": 20 } }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PixelSettings {
    /// Base URL of the analytics API.
    pub api_base: String,
    /// Full collection URL; overrides `apiBase` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Session window settings.
    pub session: SessionSettings,
    /// Delivery queue settings.
    pub delivery: DeliverySettings,
    /// Storage backend settings.
    pub storage: StorageSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for PixelSettings {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000".to_string(),
            endpoint: None,
            session: SessionSettings::default(),
            delivery: DeliverySettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl PixelSettings {
    /// URL every envelope is posted to.
    pub fn collect_url(&self) -> String {
        match self.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => endpoint.to_string(),
            _ => format!("{}{COLLECT_PATH}", self.api_base.trim_end_matches('/')),
        }
    }
}

/// Session window settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Inactivity after which a new session starts, in minutes.
    pub timeout_minutes: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
        }
    }
}

impl SessionSettings {
    /// Inactivity timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }
}

/// Delivery queue settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Requeue policy for transport failures.
    pub retry: RetryPolicy,
    /// Per-request timeout. Unset leaves the HTTP client's defaults in place.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

/// Storage backend settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// File backing durable storage. Defaults to `~/.pixel/storage.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable_path: Option<String>,
}

impl StorageSettings {
    /// Resolved durable storage path.
    pub fn durable_path(&self) -> PathBuf {
        self.durable_path
            .as_ref()
            .map_or_else(|| pixel_dir().join("storage.json"), PathBuf::from)
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace` … `error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

/// `~/.pixel`, falling back to `/tmp/.pixel` without a home directory.
pub fn pixel_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pixel")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
