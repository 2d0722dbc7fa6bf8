//! Reading `kiln.toml` and checking it before anything is resolved.

use std::path::Path;

use crate::error::ConfigError;
use crate::types::KilnConfig;

/// Name of the configuration file looked up in a project directory.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Loads and validates the `kiln.toml` in `project_dir`.
pub fn load_config(project_dir: &Path) -> Result<KilnConfig, ConfigError> {
    let path = project_dir.join(CONFIG_FILE);
    let content =
        std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?;
    load_config_from_str(&content)
}

/// Parses and validates configuration text.
///
/// A leading dot on `build.extension` is dropped, so `.js` and `js` are the
/// same setting.
pub fn load_config_from_str(content: &str) -> Result<KilnConfig, ConfigError> {
    let mut config: KilnConfig = toml::from_str(content)?;
    if let Some(stripped) = config.build.extension.strip_prefix('.') {
        config.build.extension = stripped.to_string();
    }
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &KilnConfig) -> Result<(), ConfigError> {
    let build = &config.build;
    if build.source.is_empty() {
        return Err(ConfigError::Missing("build.source"));
    }
    if build.output.is_empty() {
        return Err(ConfigError::Missing("build.output"));
    }
    if build.extension.is_empty() || build.extension.contains(['/', '\\']) {
        return Err(ConfigError::Invalid {
            key: "build.extension",
            reason: format!("'{}' is not a bare file extension", build.extension),
        });
    }
    if build.resolvers.is_empty() {
        return Err(ConfigError::Invalid {
            key: "build.resolvers",
            reason: "at least one resolver must follow the cache".to_string(),
        });
    }
    if Path::new(&build.output).is_absolute() {
        return Err(ConfigError::Invalid {
            key: "build.output",
            reason: format!("'{}' must be relative to the destination", build.output),
        });
    }
    Ok(())
}
