//! Storage layer for annotation graphs
//!
//! Graphs are persisted one file per (document, data owner) by the
//! [`FileStorageDriver`], cached in memory by the [`AnnotationGraphCache`] and
//! guarded by per-key locks from the [`AccessController`]. Callers only use the
//! [`AnnotationStorageService`] and the [`StorageSession`]s it opens:
//!
//! ```no_run
//! use annotation_store::core::StorageConfig;
//! use annotation_store::storage::{AccessMode, AnnotationStorageService, UpgradeMode};
//! use annotation_store::types::{AnnotationGraph, DocumentKey};
//!
//! # fn main() -> annotation_store::types::Result<()> {
//! let service = AnnotationStorageService::new(&StorageConfig::with_data_dir("./data"))?;
//! let key = DocumentKey::from_parts(1, 42, "anna")?;
//!
//! let session = service.open_session(false)?;
//! let mut handle = service.read_or_create(&session, &key, UpgradeMode::Auto, AccessMode::ExclusiveWrite, || {
//!     Ok(AnnotationGraph::new(0))
//! })?;
//! handle.write()?.add_annotation("token", 0, 5);
//! service.write(&session, &handle)?;
//! # Ok(())
//! # }
//! ```

/// Reader/writer locks per document key
pub mod access;
/// History copies of overwritten files
pub mod backup;
/// Loaded-graph cache
pub mod cache;
/// On-disk graph formats
pub mod codec;
/// File persistence with backup and optimistic concurrency check
pub mod driver;
/// Schema generations and upgrades
pub mod schema;
/// The storage façade
pub mod service;
/// Sessions and graph handles
pub mod session;

pub use access::{AccessController, AccessMode, LockGrant};
pub use backup::{BackupHistory, HistoryEntry};
pub use cache::{AnnotationGraphCache, CacheEntry, CacheStats, GraphCell, SharedGraph};
pub use codec::{codec_for, BincodeCodec, GraphCodec, JsonCodec, MessagePackCodec};
pub use driver::{FileStorageDriver, RecoveryReport};
pub use schema::{RestampUpgrader, SchemaChanged, SchemaRegistry, SchemaUpgrader, UpgradeMode};
pub use service::AnnotationStorageService;
pub use session::{GraphHandle, SessionId, StorageSession};
