//! In-memory graph cache
//!
//! Maps each [`DocumentKey`] to the most recently loaded graph together with
//! the file version it corresponds to and the schema generations it was
//! validated against. Entries are dropped on schema-change events, deletes and
//! unpersisted modifications; sessions holding an evicted graph keep their
//! reference, the next acquisition loads a new instance.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use dashmap::DashMap;
use flume::Receiver;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use tracing::debug;
use crate::storage::schema::SchemaChanged;
use crate::system::metrics::Metrics;
use crate::types::{AnnotationGraph, DocumentKey, FileVersion, ProjectId};

/// Shared, lockable graph instance. Two acquisitions got "the same graph" iff
/// their `SharedGraph`s are `Arc::ptr_eq`.
pub type SharedGraph = Arc<GraphCell>;

/// A graph behind a reader/writer lock, with a flag recording whether it was
/// changed since it was last loaded or written
#[derive(Debug)]
pub struct GraphCell {
    graph: RwLock<AnnotationGraph>,
    modified: AtomicBool,
}

impl GraphCell {
    /// Wrap a freshly loaded or written graph
    pub fn new(graph: AnnotationGraph) -> SharedGraph {
        Arc::new(Self {
            graph: RwLock::new(graph),
            modified: AtomicBool::new(false),
        })
    }

    /// Read access
    pub fn read(&self) -> RwLockReadGuard<'_, AnnotationGraph> {
        self.graph.read()
    }

    /// Write access; marks the graph modified
    pub fn write(&self) -> RwLockWriteGuard<'_, AnnotationGraph> {
        self.modified.store(true, Ordering::Release);
        self.graph.write()
    }

    /// True if the graph changed since it was last loaded or written
    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub(crate) fn mark_persisted(&self, version: FileVersion) {
        self.graph.write().set_version(version);
        self.modified.store(false, Ordering::Release);
    }

    /// On-disk version the graph corresponds to
    pub fn version(&self) -> Option<FileVersion> {
        self.graph.read().version().copied()
    }
}

/// One cached graph
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached instance
    pub graph: SharedGraph,
    /// File version the instance corresponds to
    pub version: FileVersion,
    /// Schema generation the graph was built against
    pub schema_generation: u64,
    /// Project generation current when the entry was stored
    pub project_generation: u64,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Acquisitions served from the cache
    pub hits: u64,
    /// Acquisitions that loaded or initialized the graph
    pub misses: u64,
    /// Entries dropped
    pub invalidations: u64,
    /// Entries currently cached
    pub entries: usize,
}

/// Cache of loaded graphs keyed by document and owner
pub struct AnnotationGraphCache {
    entries: DashMap<DocumentKey, CacheEntry>,
    events: Receiver<SchemaChanged>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    metrics: Option<&'static Metrics>,
}

impl AnnotationGraphCache {
    /// Create an empty cache consuming schema-change events from `events`
    pub fn new(events: Receiver<SchemaChanged>) -> Self {
        Self {
            entries: DashMap::new(),
            events,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Mirror the counters into the global metrics
    pub fn with_metrics(mut self, metrics: &'static Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cached entry for `key`, after applying pending schema-change events
    pub fn get(&self, key: &DocumentKey) -> Option<CacheEntry> {
        self.drain_events();
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store or replace the entry for `key`
    pub fn put(&self, key: DocumentKey, entry: CacheEntry) {
        debug!("Caching {} at {}", key, entry.version);
        self.entries.insert(key, entry);
    }

    /// Drop the entry for `key`; returns whether there was one
    pub fn invalidate(&self, key: &DocumentKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.count_invalidations(1);
            debug!("Invalidated cache entry of {}", key);
        }
        removed
    }

    /// Drop the entry for `key` only if it still holds `graph`
    pub fn invalidate_instance(&self, key: &DocumentKey, graph: &SharedGraph) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, entry| Arc::ptr_eq(&entry.graph, graph))
            .is_some();
        if removed {
            self.count_invalidations(1);
            debug!("Invalidated unpersisted cache entry of {}", key);
        }
        removed
    }

    /// Drop every entry of `project`; returns how many were dropped
    pub fn invalidate_by_schema_change(&self, project: ProjectId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.project() != project);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.count_invalidations(removed as u64);
        }
        debug!("Schema change of project {} invalidated {} entries", project, removed);
        removed
    }

    /// Record a new file version for the cached instance `graph`. Entries
    /// holding another instance are left alone.
    pub fn update_version(&self, key: &DocumentKey, graph: &SharedGraph, version: FileVersion) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if Arc::ptr_eq(&entry.graph, graph) => {
                entry.version = version;
                true
            }
            _ => false,
        }
    }

    /// Apply pending schema-change events
    pub fn drain_events(&self) {
        for event in self.events.try_iter() {
            self.invalidate_by_schema_change(event.project);
        }
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = self.metrics {
            metrics.cache.hits.inc();
        }
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = self.metrics {
            metrics.cache.misses.inc();
        }
    }

    fn count_invalidations(&self, n: u64) {
        self.invalidations.fetch_add(n, Ordering::Relaxed);
        if let Some(metrics) = self.metrics {
            metrics.cache.invalidations.inc_by(n);
        }
    }
}
