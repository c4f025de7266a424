//! Configuration module
//!
//! Loads server settings from a TOML file with per-field defaults.

mod settings;

pub use settings::*;
