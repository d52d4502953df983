/// Type definitions for the annotation store
///
/// This module contains all type definitions organized by category.

/// Identifier types
pub mod ids;
/// In-memory annotation graph
pub mod graph;
/// System-wide error types
pub mod error;
/// On-disk version markers
pub mod storage;

// Re-export commonly used types for convenience
pub use ids::{ProjectId, SourceDocumentId, DataOwner, DocumentKey};
pub use graph::{AnnotationGraph, Annotation, AnnotationId, FeatureValue, GraphMetadata};
pub use error::{Error, Result, BoxError, StorageError, SerializationError, ContractViolation};
pub use storage::{Timestamp, ContentDigest, FileVersion, FileRecord};
