//! # pixel-settings
//!
//! Layered configuration for the pixel client.
//!
//! Settings are resolved from four layers (in priority order, lowest first):
//! 1. **Compiled defaults**: [`PixelSettings::default()`]
//! 2. **User file**: `~/.pixel/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PIXEL_*` overrides
//! 4. **Host-page data attributes**: `data-api-base`, `data-endpoint`,
//!    `data-session-timeout` on the installing script tag

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_script_attributes, load_settings, load_settings_from_path,
    settings_path, validate,
};
pub use types::*;
