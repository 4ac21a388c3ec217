//! Shared configuration for Mirrorbox.
//!
//! One TOML file plus environment overrides, loaded and validated in one
//! place so the daemon and any future tooling agree on defaults and
//! validation rules.

pub mod loader;
pub mod models;

pub use loader::{load, ConfigError};
pub use models::{Config, DriveConfig};
