//! Configuration file resolution and loading
//!
//! Config files are located in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Platform config directory (`<config_dir>/lucid/<file_name>`)
//! 4. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable consulted for an explicit config file path
pub const CONFIG_ENV_VAR: &str = "LUCID_CONFIG";

/// Default config file name inside the platform config directory
pub const CONFIG_FILE_NAME: &str = "lucid.toml";

/// Where a configuration was loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    CommandLine(PathBuf),
    Environment(PathBuf),
    PlatformDefault(PathBuf),
    CompiledDefaults,
}

impl ConfigSource {
    /// Path of the backing file, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::CommandLine(p) | Self::Environment(p) | Self::PlatformDefault(p) => Some(p),
            Self::CompiledDefaults => None,
        }
    }
}

/// Logging section shared by every lucid binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by RUST_LOG)
    pub level: String,
    /// Include the event target (module path) in output
    pub with_target: bool,
    /// Emit ANSI colour codes
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
            ansi: true,
        }
    }
}

/// Resolve which config file (if any) should be loaded
///
/// An explicitly requested file (argument or environment) must exist; a missing
/// platform default silently falls back to compiled defaults.
pub fn resolve_config_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> Result<ConfigSource> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        if !path.exists() {
            return Err(Error::ConfigNotFound {
                origin: "command line".to_string(),
                path: path.to_path_buf(),
            });
        }
        return Ok(ConfigSource::CommandLine(path.to_path_buf()));
    }

    // Priority 2: Environment variable
    if let Ok(value) = std::env::var(env_var_name) {
        if !value.trim().is_empty() {
            let path = PathBuf::from(value);
            if !path.exists() {
                return Err(Error::ConfigNotFound {
                    origin: env_var_name.to_string(),
                    path,
                });
            }
            return Ok(ConfigSource::Environment(path));
        }
    }

    // Priority 3: Platform config directory
    if let Some(path) = dirs::config_dir().map(|d| d.join("lucid").join(file_name)) {
        if path.exists() {
            return Ok(ConfigSource::PlatformDefault(path));
        }
        debug!(path = %path.display(), "No platform config file");
    }

    // Priority 4: Compiled defaults
    Ok(ConfigSource::CompiledDefaults)
}

/// Parse a TOML config of type `T` from the resolved source
pub fn load_toml<T>(source: &ConfigSource) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = source.path() else {
        return Ok(T::default());
    };

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Resolve and load a config in one step
pub fn load_config<T>(cli_arg: Option<&Path>) -> Result<(T, ConfigSource)>
where
    T: DeserializeOwned + Default,
{
    let source = resolve_config_path(cli_arg, CONFIG_ENV_VAR, CONFIG_FILE_NAME)?;
    let config = load_toml(&source)?;
    Ok((config, source))
}

/// Platform cache directory for lucid data (`<cache_dir>/lucid`)
pub fn platform_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("lucid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_defaults() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.level, "info");
        assert!(logging.ansi);
    }

    #[test]
    fn test_missing_cli_path_is_error() {
        let result = resolve_config_path(
            Some(Path::new("/definitely/not/here/lucid.toml")),
            "LUCID_TEST_UNSET_VAR",
            CONFIG_FILE_NAME,
        );
        assert!(matches!(
            result,
            Err(Error::ConfigNotFound { ref origin, .. }) if origin == "command line"
        ));
    }

    #[test]
    fn test_compiled_defaults_have_no_path() {
        let logging: LoggingConfig = load_toml(&ConfigSource::CompiledDefaults).unwrap();
        assert_eq!(logging, LoggingConfig::default());
    }
}
