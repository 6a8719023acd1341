//! # courier-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`CourierSettings::default()`])
//! 2. **User file** `~/.courier/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** `COURIER_*` overrides (highest priority)
//!
//! ```no_run
//! use courier_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! let config = settings.delivery_config();
//! println!("delivering to {}", config.endpoint);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
