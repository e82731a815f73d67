//! # pixel-logging
//!
//! `tracing` subscriber setup for binaries embedding the pixel client.
//!
//! Library crates only emit events through `tracing`; installing a
//! subscriber is the host's call. [`init_logging`] is the one the `pixel`
//! binary uses: an env filter (`RUST_LOG` wins over configuration) feeding
//! either JSON lines or human-readable output on stderr.

#![deny(unsafe_code)]

use std::str::FromStr;

use pixel_settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging subsystem.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub level: Level,
    /// Per-module level overrides (e.g. `"pixel_client::delivery"` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of pretty output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl From<&LoggingSettings> for LoggingConfig {
    fn from(settings: &LoggingSettings) -> Self {
        Self {
            level: Level::from_str(&settings.level).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json: settings.json,
        }
    }
}

impl LoggingConfig {
    /// Filter directive built from the configured levels.
    pub fn directive(&self) -> String {
        let mut filter = self.level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed; the existing
/// one is left untouched.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry().with(fmt_layer).try_init().is_ok()
}
