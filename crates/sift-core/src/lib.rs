//! Configuration for sift: TOML file, `SIFT_*` environment overrides and
//! conversion into engine settings.

pub mod config;

pub use config::{Config, ConfigError};
