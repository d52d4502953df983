//! Concurrency stress harness
//!
//! Runs exclusive writers, shared readers, unmanaged observers and deleters
//! against a small set of documents for a fixed time, then checks that every
//! remaining graph file still decodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use crate::storage::{AccessMode, AnnotationStorageService, UpgradeMode};
use crate::types::{AnnotationGraph, DocumentKey, Error, FeatureValue, Result};

/// Unexpected errors kept for the report
const MAX_RECORDED_FAILURES: usize = 20;

/// Shape of a stress run
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Threads acquiring exclusively, modifying and writing
    pub writers: usize,
    /// Threads acquiring shared and reading
    pub readers: usize,
    /// Threads reading without locks and without initializing
    pub observers: usize,
    /// Threads deleting graphs
    pub deleters: usize,
    /// Number of distinct documents the threads contend on
    pub documents: u64,
    /// Project the documents belong to
    pub project: u64,
    /// How long the threads run
    pub duration: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(2);
        Self {
            writers: cpus,
            readers: cpus,
            observers: 1,
            deleters: 1,
            documents: 4,
            project: 1,
            duration: Duration::from_secs(2),
        }
    }
}

/// Outcome of a stress run
#[derive(Debug, Clone, Default, Serialize)]
pub struct StressReport {
    /// Successful writes
    pub writes: u64,
    /// Writes rejected by the concurrency check
    pub rejected_writes: u64,
    /// Successful shared reads
    pub reads: u64,
    /// Successful unmanaged reads
    pub observed: u64,
    /// Reads that found no graph because a deleter got there first
    pub not_found: u64,
    /// Deletes that removed a file
    pub deletes: u64,
    /// Graph files left at the end, all of which decoded
    pub final_graphs: usize,
    /// Unexpected errors
    pub failures: Vec<String>,
    /// Wall-clock duration
    pub elapsed_ms: u128,
}

impl StressReport {
    /// True if no unexpected error occurred
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
struct Counters {
    writes: AtomicU64,
    rejected_writes: AtomicU64,
    reads: AtomicU64,
    observed: AtomicU64,
    not_found: AtomicU64,
    deletes: AtomicU64,
    failures: Mutex<Vec<String>>,
}

impl Counters {
    fn fail(&self, role: &str, err: &Error) {
        warn!("Stress {} failed: {}", role, err);
        let mut failures = self.failures.lock();
        if failures.len() < MAX_RECORDED_FAILURES {
            failures.push(format!("{}: {}", role, err));
        }
    }
}

/// Run the harness against `service`
pub fn run(service: &AnnotationStorageService, config: &StressConfig) -> Result<StressReport> {
    let keys = (1..=config.documents.max(1))
        .map(|document| DocumentKey::from_parts(config.project, document, "stress"))
        .collect::<Result<Vec<_>>>()?;
    let counters = Counters::default();
    let started = Instant::now();
    let deadline = started + config.duration;

    info!(
        "Stress run: {} writers, {} readers, {} observers, {} deleters on {} documents for {:?}",
        config.writers,
        config.readers,
        config.observers,
        config.deleters,
        keys.len(),
        config.duration
    );

    crossbeam::scope(|scope| {
        for _ in 0..config.writers {
            scope.spawn(|_| writer(service, &keys, deadline, &counters));
        }
        for _ in 0..config.readers {
            scope.spawn(|_| reader(service, &keys, deadline, &counters));
        }
        for _ in 0..config.observers {
            scope.spawn(|_| observer(service, &keys, deadline, &counters));
        }
        for _ in 0..config.deleters {
            scope.spawn(|_| deleter(service, &keys, deadline, &counters));
        }
    })
    .map_err(|_| Error::internal("a stress worker panicked"))?;

    let mut final_graphs = 0;
    for key in &keys {
        if !service.exists(key) {
            continue;
        }
        match service.inspect(key) {
            Ok(_) => final_graphs += 1,
            Err(e) => counters.fail("final check", &e),
        }
    }

    let report = StressReport {
        writes: counters.writes.into_inner(),
        rejected_writes: counters.rejected_writes.into_inner(),
        reads: counters.reads.into_inner(),
        observed: counters.observed.into_inner(),
        not_found: counters.not_found.into_inner(),
        deletes: counters.deletes.into_inner(),
        final_graphs,
        failures: counters.failures.into_inner(),
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(
        "Stress run finished: {} writes, {} reads, {} deletes, {} failures",
        report.writes,
        report.reads,
        report.deletes,
        report.failures.len()
    );
    Ok(report)
}

fn pick<'a>(keys: &'a [DocumentKey], rng: &mut impl Rng) -> &'a DocumentKey {
    &keys[rng.random_range(0..keys.len())]
}

fn writer(service: &AnnotationStorageService, keys: &[DocumentKey], deadline: Instant, counters: &Counters) {
    let mut rng = rand::rng();
    while Instant::now() < deadline {
        let key = pick(keys, &mut rng);
        let begin = rng.random_range(0..1_000u32);
        let result = service.open_session(false).and_then(|session| {
            let mut handle = service.read_or_create(&session, key, UpgradeMode::Auto, AccessMode::ExclusiveWrite, || {
                Ok(AnnotationGraph::new(0))
            })?;
            {
                let mut graph = handle.write()?;
                let id = graph.add_annotation("token", begin, begin + 3);
                graph.set_feature(id, "writer", FeatureValue::Text(format!("{:?}", thread::current().id())));
            }
            service.write(&session, &handle)
        });
        match result {
            Ok(_) => {
                counters.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_concurrent_modification() => {
                counters.rejected_writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => counters.fail("writer", &e),
        }
    }
}

fn reader(service: &AnnotationStorageService, keys: &[DocumentKey], deadline: Instant, counters: &Counters) {
    let mut rng = rand::rng();
    while Instant::now() < deadline {
        let key = pick(keys, &mut rng);
        let result = service.open_session(false).and_then(|session| {
            let handle = service.read(&session, key, AccessMode::SharedReadOnly)?;
            let len = handle.read()?.len();
            Ok(len)
        });
        match result {
            Ok(_) => {
                counters.reads.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_not_found() => {
                counters.not_found.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => counters.fail("reader", &e),
        }
    }
}

fn observer(service: &AnnotationStorageService, keys: &[DocumentKey], deadline: Instant, counters: &Counters) {
    let mut rng = rand::rng();
    while Instant::now() < deadline {
        let key = pick(keys, &mut rng);
        let result = service.open_session(false).and_then(|session| {
            let handle = service.read(&session, key, AccessMode::UnmanagedNonInitializing)?;
            let len = handle.read()?.len();
            Ok(len)
        });
        match result {
            Ok(_) => {
                counters.observed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_not_found() => {
                counters.not_found.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => counters.fail("observer", &e),
        }
    }
}

fn deleter(service: &AnnotationStorageService, keys: &[DocumentKey], deadline: Instant, counters: &Counters) {
    let mut rng = rand::rng();
    while Instant::now() < deadline {
        let key = pick(keys, &mut rng);
        let result = service
            .open_session(false)
            .and_then(|session| service.delete(&session, key));
        match result {
            Ok(true) => {
                counters.deletes.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(e) => counters.fail("deleter", &e),
        }
        thread::sleep(Duration::from_millis(rng.random_range(5..25)));
    }
}
