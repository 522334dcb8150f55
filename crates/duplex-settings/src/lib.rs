//! # duplex-settings
//!
//! Layered configuration for the Duplex engine.
//!
//! Settings load from three layers, lowest priority first: compiled
//! defaults, `~/.duplex/settings.json` (deep-merged), then `DUPLEX_*`
//! environment variables with strict parsing.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{DuplexSettings, LoggingSettings, OpLogSettings, ReconcilerPair, ReconcilerSettings};
