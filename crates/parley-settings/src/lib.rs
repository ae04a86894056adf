//! # parley-settings
//!
//! Layered configuration for the parley server.
//!
//! Sources, lowest priority first:
//! 1. **Compiled defaults** from each section's `Default`
//! 2. **Settings file**: `--config PATH` or `~/.parley/settings.json`
//! 3. **Environment variables**: `PARLEY_<SECTION>__<KEY>` (e.g. `PARLEY_SERVER__PORT`)

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{figment, load_settings, parley_dir, settings_path};
pub use types::*;
