//! On-disk version markers used by the optimistic concurrency check.
//!
//! The modification time of a graph file is its version. Timestamps are only
//! ever compared for equality: external tools and clock skew make ordering
//! meaningless. Size and (optionally) a content digest tighten the check on
//! filesystems whose timestamp resolution is coarse.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use serde::{Deserialize, Serialize};

/// Filesystem modification time in nanoseconds since the Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(u64);

/// blake3 digest of a graph file's content
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ContentDigest([u8; 32]);

/// Version of a graph file as observed when it was read or written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileVersion {
    /// Modification time
    pub timestamp: Timestamp,
    /// File size in bytes
    pub size: u64,
    /// Content digest, present when digest checking is enabled
    pub digest: Option<ContentDigest>,
}

/// Persisted bytes of one graph together with their version
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Raw file content
    pub bytes: Vec<u8>,
    /// Version at the time of the read
    pub version: FileVersion,
}

impl Timestamp {
    /// Create timestamp from current time
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert a filesystem time; times before the epoch collapse to zero
    pub fn from_system_time(time: SystemTime) -> Self {
        let nanos = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self(nanos)
    }

    /// Create from nanoseconds since epoch
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Get nanoseconds since epoch
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get milliseconds since epoch
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Back to a `SystemTime`
    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}ns)", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

impl ContentDigest {
    /// Digest of a complete byte slice
    pub fn of(bytes: &[u8]) -> Self {
        ContentDigest(*blake3::hash(bytes).as_bytes())
    }

    /// Wrap a finished hasher
    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        ContentDigest(*hasher.finalize().as_bytes())
    }

    /// Get the underlying bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FileVersion {
    /// True if `current` is the same file state this version was taken from.
    ///
    /// Digests are only compared when both sides carry one.
    pub fn matches(&self, current: &FileVersion) -> bool {
        if self.timestamp != current.timestamp || self.size != current.size {
            return false;
        }
        match (&self.digest, &current.digest) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[mtime {} size {}", self.timestamp, self.size)?;
        if let Some(digest) = &self.digest {
            write!(f, " blake3 {}", hex::encode(&digest.as_bytes()[..8]))?;
        }
        f.write_str("]")
    }
}
