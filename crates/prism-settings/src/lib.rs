//! Layered configuration for prism hosts.
//!
//! Compiled defaults, then an optional JSON settings file deep-merged over
//! them, then `PRISM_*` environment overrides. The engine itself never reads
//! files or the environment; hosts load [`PrismSettings`] here and convert.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{EngineSettings, LogFormat, LoggingSettings, PrismSettings};
