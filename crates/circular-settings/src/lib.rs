//! # circular-settings
//!
//! Layered configuration for the signing engine:
//! 1. **Compiled defaults** ([`CircularSettings::default()`])
//! 2. **Settings file** (`~/.circular/settings.json` or `$CIRCULAR_SETTINGS`), deep-merged
//! 3. **Environment**: `CIRCULAR_*` overrides
//!
//! ```no_run
//! let settings = circular_settings::get_settings();
//! println!("ledger at {}", settings.database.path);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<CircularSettings> = OnceLock::new();

/// Global settings. Loaded on first call; falls back to defaults when loading fails.
pub fn get_settings() -> &'static CircularSettings {
    SETTINGS.get_or_init(|| match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            CircularSettings::default()
        }
    })
}

/// Install settings explicitly, before anything calls [`get_settings`]. The
/// CLI does this when `--config` names a file. Hands the value back if the
/// global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: CircularSettings) -> std::result::Result<(), CircularSettings> {
    SETTINGS.set(settings)
}
