//! Core configuration and process-level setup
//!
//! This module contains configuration loading and logging initialisation.

pub mod config;
pub mod logging;

// Re-export commonly used items
pub use config::{Config, StorageConfig, BackupConfig, CodecKind, ConcurrencyCheck};
pub use logging::init_logging;
