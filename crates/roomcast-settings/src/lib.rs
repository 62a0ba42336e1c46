//! # roomcast-settings
//!
//! Configuration for the roomcast server, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`RoomcastSettings::default()`]
//! 2. **Settings file**: `~/.roomcast/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `ROOMCAST_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
