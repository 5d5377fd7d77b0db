//! Errors raised before an analysis starts
//!
//! Locating and parsing config files, range-checking settings and installing
//! the tracing subscriber. Analysis failures live in `lucid-vision`.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for config and setup operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A config file named on the command line or in the environment is missing
    #[error("Config file from {origin} not found: {}", .path.display())]
    ConfigNotFound { origin: String, path: PathBuf },

    /// Config file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A setting parsed but is out of range or inconsistent
    #[error("Invalid setting '{key}': {reason}")]
    InvalidSetting { key: String, reason: String },

    /// Global tracing subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl Error {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
