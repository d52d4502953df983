//! Annotation Store - storage core for collaborative annotation graphs
//!
//! Keeps one annotation graph per (document, data owner) on disk and in a
//! shared cache while many sessions read and write concurrently. Writes are
//! checked against the file version the writer loaded, failed writes are
//! rolled back from a backup, and cached graphs are dropped when the file or
//! the project's schema changes.
#![warn(missing_docs)]

// Configuration and process setup
pub mod core;

// Main functional modules
pub mod types;
pub mod storage;
pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::Config;
pub use storage::{AccessMode, AnnotationStorageService, GraphHandle, StorageSession, UpgradeMode};
pub use types::{AnnotationGraph, DocumentKey, Error, Result};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize logging and metrics for a process embedding the store
pub fn init(config: &Config) -> Result<()> {
    crate::core::init_logging(&config.logging)?;
    tracing::info!("Initializing {} v{}", NAME, VERSION);

    if config.metrics.enable_prometheus {
        system::metrics::init_registry();
    }

    Ok(())
}
