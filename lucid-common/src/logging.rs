//! Tracing subscriber initialisation

use crate::config::LoggingConfig;
use crate::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber
///
/// `RUST_LOG` takes precedence over `logging.level`.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| Error::invalid("logging.level", format!("'{}': {}", logging.level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.with_target)
        .with_ansi(logging.ansi)
        .try_init()
        .map_err(|e| Error::Logging(format!("Tracing already initialised: {}", e)))
}
