//! Parsing and validation of `kiln.toml` build configuration files.
//!
//! This crate reads the configuration file and produces a strongly-typed
//! [`KilnConfig`], then resolves it into a [`ResolvedBuild`] with absolute
//! paths, defaults applied, and the output kind decided.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod resolve;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, CONFIG_FILE};
pub use resolve::{decide_output_kind, resolve_build, OutputKindOrigin, ResolvedBuild};
pub use types::*;
