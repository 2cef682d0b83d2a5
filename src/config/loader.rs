//! Configuration file loading.

use std::path::Path;

use super::error::{ConfigError, ConfigResult};
use super::types::Config;

/// Load and validate a configuration file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid YAML, or
/// fails semantic validation.
pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    load_str(&content)
}

/// Load and validate configuration from a YAML string.
pub fn load_str(content: &str) -> ConfigResult<Config> {
    let config: Config = serde_yaml::from_str(content)?;
    config.validate()?;
    Ok(config)
}
