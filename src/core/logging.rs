//! Logging setup
//!
//! The library only emits `tracing` events; binaries and tests decide whether
//! and how to subscribe. `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::EnvFilter;
use crate::core::config::LoggingConfig;
use crate::types::error::{Error, Result};

/// Install a global `tracing` subscriber according to the logging configuration.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };

    installed.map_err(|e| Error::config(format!("Failed to install log subscriber: {}", e)))
}

/// Install a subscriber for tests; repeated calls are ignored.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
