//! Metrics collection for the annotation store
//!
//! Prometheus counters for cache, disk and lock activity, registered once on a
//! crate-level registry.

use crate::types::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntGauge, Registry,
};
use std::time::Instant;

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Cache metrics
pub struct CacheMetrics {
    /// Acquisitions served from the cache
    pub hits: IntCounter,
    /// Acquisitions that had to load from disk or initialize
    pub misses: IntCounter,
    /// Entries dropped by deletes, schema changes or unpersisted modifications
    pub invalidations: IntCounter,
}

/// Disk metrics
pub struct DiskMetrics {
    /// Graph files read
    pub reads: IntCounter,
    /// Graph files written
    pub writes: IntCounter,
    /// Graph files deleted
    pub deletes: IntCounter,
    /// Writes rejected by the optimistic concurrency check
    pub rejected_writes: IntCounter,
    /// Failed writes rolled back from the backup file
    pub restored_backups: IntCounter,
    /// History backups retained
    pub history_backups: IntCounter,
}

/// Session and lock metrics
pub struct SessionMetrics {
    /// Currently open top-level sessions
    pub open_sessions: IntGauge,
    /// Lock acquisitions that had to wait for another session
    pub lock_waits: IntCounter,
    /// Histogram of storage operation durations in seconds, by operation
    pub operation_duration: HistogramVec,
}

/// Centralized metrics collection for all storage components
pub struct Metrics {
    /// Cache metrics
    pub cache: CacheMetrics,
    /// Disk metrics
    pub disk: DiskMetrics,
    /// Session and lock metrics
    pub sessions: SessionMetrics,
}

impl Metrics {
    /// Create new metrics instance
    fn new() -> Result<Self> {
        Ok(Self {
            cache: CacheMetrics::new()?,
            disk: DiskMetrics::new()?,
            sessions: SessionMetrics::new()?,
        })
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Metrics {
        static INSTANCE: Lazy<Metrics> = Lazy::new(|| {
            Metrics::new().expect("Failed to initialize metrics")
        });
        &INSTANCE
    }
}

impl CacheMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            hits: register_int_counter_with_registry!(
                "annotation_cache_hits_total",
                "Graph acquisitions served from the cache",
                REGISTRY
            )?,
            misses: register_int_counter_with_registry!(
                "annotation_cache_misses_total",
                "Graph acquisitions loaded from disk or initialized",
                REGISTRY
            )?,
            invalidations: register_int_counter_with_registry!(
                "annotation_cache_invalidations_total",
                "Cache entries invalidated",
                REGISTRY
            )?,
        })
    }
}

impl DiskMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            reads: register_int_counter_with_registry!(
                "annotation_disk_reads_total",
                "Graph files read",
                REGISTRY
            )?,
            writes: register_int_counter_with_registry!(
                "annotation_disk_writes_total",
                "Graph files written",
                REGISTRY
            )?,
            deletes: register_int_counter_with_registry!(
                "annotation_disk_deletes_total",
                "Graph files deleted",
                REGISTRY
            )?,
            rejected_writes: register_int_counter_with_registry!(
                "annotation_rejected_writes_total",
                "Writes rejected because the file changed since it was loaded",
                REGISTRY
            )?,
            restored_backups: register_int_counter_with_registry!(
                "annotation_restored_backups_total",
                "Failed writes rolled back from the backup file",
                REGISTRY
            )?,
            history_backups: register_int_counter_with_registry!(
                "annotation_history_backups_total",
                "Pre-write copies kept as history",
                REGISTRY
            )?,
        })
    }
}

impl SessionMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            open_sessions: register_int_gauge_with_registry!(
                "annotation_open_sessions",
                "Currently open storage sessions",
                REGISTRY
            )?,
            lock_waits: register_int_counter_with_registry!(
                "annotation_lock_waits_total",
                "Lock acquisitions that waited for another session",
                REGISTRY
            )?,
            operation_duration: register_histogram_vec_with_registry!(
                "annotation_operation_duration_seconds",
                "Duration of storage operations in seconds",
                &["operation"],
                vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
                REGISTRY
            )?,
        })
    }
}

/// Timer for measuring operation duration with automatic histogram recording
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start a new timer for a named operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    /// Record the elapsed time and consume the timer
    pub fn finish(self) {
        Metrics::global()
            .sessions
            .operation_duration
            .with_label_values(&[self.operation])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// Initialize the metrics registry by creating the global metrics instance
pub fn init_registry() {
    let _ = Metrics::global();
}

/// Get the Prometheus registry for serving metrics to monitoring systems
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Collect and return all metrics as a Prometheus-formatted string
pub fn collect_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry().gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        init_registry();
        Metrics::global().disk.reads.inc();
        Timer::start("test").finish();
        let text = collect_metrics();
        assert!(text.contains("annotation_disk_reads_total"));
        assert!(text.contains("annotation_operation_duration_seconds"));
    }
}
