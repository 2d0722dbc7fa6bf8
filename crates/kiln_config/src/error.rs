//! Configuration errors.

use std::path::PathBuf;

/// Why a `kiln.toml` could not be turned into a usable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// The configuration file path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the expected schema.
    #[error("malformed kiln.toml: {0}")]
    Syntax(#[from] toml::de::Error),

    /// A required key is absent or empty.
    #[error("`{0}` is required")]
    Missing(&'static str),

    /// A key holds a value the build cannot use.
    #[error("invalid `{key}`: {reason}")]
    Invalid {
        /// Dotted key path, such as `build.extension`.
        key: &'static str,
        /// What is wrong with the value.
        reason: String,
    },
}
