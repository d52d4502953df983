//! Error types and handling for the annotation store
//!
//! Errors fall into four families callers are expected to tell apart:
//! consistency errors (a concurrent writer got there first), existence errors,
//! I/O and serialization errors (reported after the on-disk state has been
//! restored), and contract violations (programming errors that must not be
//! retried).

use thiserror::Error;
use crate::types::storage::FileVersion;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by external collaborators (initializers, upgraders)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for the annotation store
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage layer errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Error raised by the schema upgrader, passed through unchanged
    #[error("Schema upgrade failed: {0}")]
    SchemaUpgrade(#[source] BoxError),

    /// Misuse of the storage API
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// The file changed since the writer loaded it
    #[error("Concurrent modification of {key}: expected {expected}, found {actual}")]
    ConcurrentModification {
        /// Document key of the rejected write
        key: String,
        /// Version the writer observed when loading
        expected: FileVersion,
        /// Version currently on disk
        actual: FileVersion,
    },

    /// A failed write could not be rolled back
    #[error("Restoring backup of {key} failed after write error ({write_error}): {restore_error}")]
    RestoreFailed {
        /// Document key of the failed write
        key: String,
        /// The error that aborted the write
        write_error: String,
        /// The error raised while restoring
        restore_error: std::io::Error,
    },
}

/// Serialization/deserialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack serialization error
    #[error("MessagePack error: {0}")]
    MessagePack(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error
    #[error("MessagePack decode error: {0}")]
    MessagePackDecode(#[from] rmp_serde::decode::Error),

    /// Bincode serialization error
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

/// Programming errors: using the API outside its contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    /// A handle or session was used after the session closed
    #[error("session {session} is closed")]
    SessionClosed {
        /// Session identifier
        session: String,
    },

    /// A top-level session was opened while another is open on this thread
    #[error("session {session} is already open on this thread")]
    SessionAlreadyOpen {
        /// Identifier of the open session
        session: String,
    },

    /// A session was used on a thread other than the one that opened it
    #[error("session {session} used outside its owner thread")]
    WrongThread {
        /// Session identifier
        session: String,
    },

    /// A session or handle from another storage service was passed in
    #[error("session {session} belongs to a different storage service")]
    ForeignSession {
        /// Session identifier
        session: String,
    },

    /// Exclusive access requested while the same session holds shared access
    #[error("cannot upgrade shared access to exclusive access on {key}")]
    LockUpgrade {
        /// Document key
        key: String,
    },

    /// Mutation or write through a handle acquired in a read-only mode
    #[error("{key} was acquired with {mode} access and cannot be modified")]
    ReadOnlyAccess {
        /// Document key
        key: String,
        /// Access mode of the acquisition
        mode: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create an already exists error
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists(resource.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap an upgrader failure
    pub fn schema_upgrade(err: impl Into<BoxError>) -> Self {
        Self::SchemaUpgrade(err.into())
    }

    /// The write was rejected by the optimistic concurrency check
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Error::Storage(StorageError::ConcurrentModification { .. }))
    }

    /// The graph or file does not exist. I/O `NotFound` counts as well since a
    /// concurrent deleter may remove a file between the existence check and the read.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Programming error; never retry
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::Contract(_))
    }

    /// Transient failure worth repeating unchanged. A concurrent modification
    /// is not: the caller has to reload the graph and reconcile first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}
