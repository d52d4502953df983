//! Annotation storage service
//!
//! The façade external callers use. An acquisition takes the lock for the
//! requested access mode, serves the graph from the cache when the cached
//! instance is still current (same project schema generation, same file
//! timestamp, no forced upgrade), and otherwise loads it from disk, runs the
//! initializer for missing files and the upgrader for outdated graphs.
//! Unmanaged acquisitions never touch the cache: they get a private copy.

use std::sync::Arc;
use tracing::{debug, info};
use crate::core::config::{Config, StorageConfig};
use crate::storage::access::{AccessController, AccessMode, LockGrant};
use crate::storage::backup::HistoryEntry;
use crate::storage::cache::{AnnotationGraphCache, CacheEntry, CacheStats, GraphCell, SharedGraph};
use crate::storage::codec::{codec_for, GraphCodec};
use crate::storage::driver::{FileStorageDriver, RecoveryReport};
use crate::storage::schema::{RestampUpgrader, SchemaRegistry, SchemaUpgrader, UpgradeMode};
use crate::storage::session::{GraphHandle, SessionId, StorageSession};
use crate::system::metrics::{Metrics, Timer};
use crate::types::{
    AnnotationGraph, ContractViolation, DocumentKey, Error, FileVersion, ProjectId, Result, Timestamp,
};

type Initializer<'a> = Box<dyn FnOnce() -> Result<AnnotationGraph> + 'a>;

/// Storage façade composing driver, cache, lock table and schema registry
pub struct AnnotationStorageService {
    driver: FileStorageDriver,
    codec: Arc<dyn GraphCodec>,
    cache: Arc<AnnotationGraphCache>,
    controller: Arc<AccessController>,
    schemas: SchemaRegistry,
    upgrader: Arc<dyn SchemaUpgrader>,
    metrics: Option<&'static Metrics>,
}

impl AnnotationStorageService {
    /// Service over `config.data_dir` without metrics
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Service configured from the full configuration, with metrics when enabled
    pub fn from_config(config: &Config) -> Result<Self> {
        let metrics = config.metrics.enable_prometheus.then(Metrics::global);
        Self::build(&config.storage, metrics)
    }

    fn build(config: &StorageConfig, metrics: Option<&'static Metrics>) -> Result<Self> {
        let codec = codec_for(config.codec);
        let mut driver = FileStorageDriver::new(config, codec.extension())?;
        let (schemas, events) = SchemaRegistry::new();
        let mut cache = AnnotationGraphCache::new(events);
        let mut controller = AccessController::new();
        if let Some(metrics) = metrics {
            driver = driver.with_metrics(metrics);
            cache = cache.with_metrics(metrics);
            controller = controller.with_metrics(metrics);
        }

        if config.recover_on_start {
            driver.recover()?;
        }
        info!(
            "Annotation storage at {} ({} codec, {:?} check)",
            config.data_dir.display(),
            codec.name(),
            config.concurrency_check
        );

        Ok(Self {
            driver,
            codec,
            cache: Arc::new(cache),
            controller: Arc::new(controller),
            schemas,
            upgrader: Arc::new(RestampUpgrader),
            metrics,
        })
    }

    /// Replace the schema upgrader
    pub fn with_upgrader(mut self, upgrader: Arc<dyn SchemaUpgrader>) -> Self {
        self.upgrader = upgrader;
        self
    }

    /// Open a session on the current thread. With `nested` an already open
    /// session is joined instead of refused.
    pub fn open_session(&self, nested: bool) -> Result<StorageSession> {
        StorageSession::open(&self.controller, &self.cache, self.metrics, nested)
    }

    /// Identifier of this service's session open on the current thread, if any
    pub fn current_session_id(&self) -> Option<SessionId> {
        StorageSession::current_id(&self.controller)
    }

    /// Acquire the graph for `key`, creating it through `initializer` when the
    /// file does not exist and the access mode initializes.
    pub fn read_or_create<F>(
        &self,
        session: &StorageSession,
        key: &DocumentKey,
        upgrade: UpgradeMode,
        mode: AccessMode,
        initializer: F,
    ) -> Result<GraphHandle>
    where
        F: FnOnce() -> Result<AnnotationGraph>,
    {
        self.timed("read_or_create", || {
            self.acquire(session, key, upgrade, mode, Some(Box::new(initializer)))
        })
    }

    /// Acquire an existing graph; a missing file is reported as not found
    pub fn read(&self, session: &StorageSession, key: &DocumentKey, mode: AccessMode) -> Result<GraphHandle> {
        self.timed("read", || self.acquire(session, key, UpgradeMode::Auto, mode, None))
    }

    /// Persist the graph behind `handle`.
    ///
    /// The write is checked against the file version the graph was loaded
    /// from; if the file changed since, the write fails with a concurrent
    /// modification error and nothing is written.
    pub fn write(&self, session: &StorageSession, handle: &GraphHandle) -> Result<FileVersion> {
        self.timed("write", || self.write_graph(session, handle))
    }

    /// Delete the graph for `key` under exclusive access. Returns false if no
    /// file existed.
    pub fn delete(&self, session: &StorageSession, key: &DocumentKey) -> Result<bool> {
        self.timed("delete", || {
            self.check_session(session)?;
            session.lock(key, AccessMode::ExclusiveWrite)?;
            self.cache.invalidate(key);
            session.forget(key);
            let deleted = self.driver.delete(key)?;
            info!("Deleted annotations of {} (existed: {})", key, deleted);
            Ok(deleted)
        })
    }

    /// True if a graph file exists for `key`
    pub fn exists(&self, key: &DocumentKey) -> bool {
        self.driver.exists(key)
    }

    /// Modification time of the graph file for `key`
    pub fn timestamp(&self, key: &DocumentKey) -> Result<Option<Timestamp>> {
        self.driver.timestamp(key)
    }

    /// History copies of the graph file for `key`, newest first
    pub fn list_history(&self, key: &DocumentKey) -> Result<Vec<HistoryEntry>> {
        self.driver.list_history(key)
    }

    /// Record a schema change of `project`; cached graphs of the project are
    /// evicted before the next lookup. Returns the new generation.
    pub fn schema_changed(&self, project: ProjectId) -> u64 {
        self.schemas.schema_changed(project)
    }

    /// Current schema generation of `project`
    pub fn schema_generation(&self, project: ProjectId) -> u64 {
        self.schemas.generation(project)
    }

    /// Seed the schema generation of `project` without invalidating anything
    pub fn set_schema_generation(&self, project: ProjectId, generation: u64) {
        self.schemas.set_generation(project, generation);
    }

    /// Cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.drain_events();
        self.cache.stats()
    }

    /// Resolve backups left by an interrupted write
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.driver.recover()
    }

    /// Decode a graph file without acquiring it (diagnostics)
    pub fn inspect(&self, key: &DocumentKey) -> Result<AnnotationGraph> {
        let record = self.driver.read(key)?;
        let mut graph = self.codec.decode(&record.bytes)?;
        graph.set_version(record.version);
        Ok(graph)
    }

    /// The underlying file driver
    pub fn driver(&self) -> &FileStorageDriver {
        &self.driver
    }

    fn timed<T>(&self, operation: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let timer = self.metrics.map(|_| Timer::start(operation));
        let result = f();
        if let Some(timer) = timer {
            timer.finish();
        }
        result
    }

    fn check_session(&self, session: &StorageSession) -> Result<()> {
        if !session.belongs_to(&self.controller) {
            return Err(ContractViolation::ForeignSession { session: session.id().to_string() }.into());
        }
        session.ensure_usable()
    }

    fn acquire(
        &self,
        session: &StorageSession,
        key: &DocumentKey,
        upgrade: UpgradeMode,
        mode: AccessMode,
        initializer: Option<Initializer<'_>>,
    ) -> Result<GraphHandle> {
        self.check_session(session)?;

        if upgrade != UpgradeMode::Force {
            if let Some((held, graph)) = session.find_resource(key, mode) {
                debug!("Session {} reuses its {} acquisition of {}", session.id(), held, key);
                return Ok(session.handle(key, mode, graph));
            }
        }

        let grant = session.lock(key, mode)?;
        let loaded = if mode.is_managed() {
            self.load_managed(key, upgrade, mode, initializer)
        } else {
            self.load(key, upgrade, mode, initializer).map(GraphCell::new)
        };

        let graph = match loaded {
            Ok(graph) => graph,
            Err(e) => {
                if grant == LockGrant::Acquired {
                    session.unlock(key);
                }
                return Err(e);
            }
        };
        session.register_resource(key, mode, &graph)?;
        Ok(session.handle(key, mode, graph))
    }

    fn load_managed(
        &self,
        key: &DocumentKey,
        upgrade: UpgradeMode,
        mode: AccessMode,
        initializer: Option<Initializer<'_>>,
    ) -> Result<SharedGraph> {
        let generation = self.schemas.generation(key.project());

        if upgrade != UpgradeMode::Force {
            if let Some(entry) = self.cache.get(key) {
                if self.is_current(key, &entry, upgrade, generation)? {
                    self.cache.record_hit();
                    debug!("Cache hit for {}", key);
                    return Ok(entry.graph);
                }
                debug!("Cached graph of {} is stale", key);
            }
        }
        self.cache.record_miss();

        let graph = self.load(key, upgrade, mode, initializer)?;
        let version = graph
            .version()
            .copied()
            .ok_or_else(|| Error::internal(format!("graph of {} was loaded without a file version", key)))?;
        let schema_generation = graph.schema_generation();
        let cell = GraphCell::new(graph);
        self.cache.put(
            key.clone(),
            CacheEntry {
                graph: cell.clone(),
                version,
                schema_generation,
                project_generation: generation,
            },
        );
        Ok(cell)
    }

    fn is_current(&self, key: &DocumentKey, entry: &CacheEntry, upgrade: UpgradeMode, generation: u64) -> Result<bool> {
        if entry.project_generation != generation {
            return Ok(false);
        }
        if upgrade != UpgradeMode::No && entry.schema_generation < generation {
            return Ok(false);
        }
        // Same tick and size can still hide an in-place edit, the digest catches it
        Ok(self.driver.version(key)?.is_some_and(|current| entry.version.matches(&current)))
    }

    /// Load from disk, or initialize and persist when the file is missing
    fn load(
        &self,
        key: &DocumentKey,
        upgrade: UpgradeMode,
        mode: AccessMode,
        initializer: Option<Initializer<'_>>,
    ) -> Result<AnnotationGraph> {
        let generation = self.schemas.generation(key.project());
        let missing = match self.decode_file(key) {
            Ok(graph) => return self.upgrade(key, graph, upgrade, generation),
            Err(e) if e.is_not_found() => e,
            Err(e) => return Err(e),
        };

        let initializer = match initializer {
            Some(initializer) if mode.initializes() => initializer,
            _ => return Err(missing),
        };

        let mut graph = initializer()?;
        graph.set_schema_generation(generation);
        match self.driver.create(key, |out| self.codec.encode(&graph, out)) {
            Ok(version) => {
                graph.set_version(version);
                info!("Initialized annotations of {}", key);
                Ok(graph)
            }
            Err(Error::AlreadyExists(_)) => {
                // Another unmanaged caller initialized the file first
                debug!("Lost initialization race for {}, loading the winner's graph", key);
                let graph = self.decode_file(key)?;
                self.upgrade(key, graph, upgrade, generation)
            }
            Err(e) => Err(e),
        }
    }

    fn decode_file(&self, key: &DocumentKey) -> Result<AnnotationGraph> {
        let record = self.driver.read(key)?;
        let mut graph = self.codec.decode(&record.bytes)?;
        graph.set_version(record.version);
        Ok(graph)
    }

    fn upgrade(&self, key: &DocumentKey, graph: AnnotationGraph, upgrade: UpgradeMode, generation: u64) -> Result<AnnotationGraph> {
        let needed = match upgrade {
            UpgradeMode::No => false,
            UpgradeMode::Auto => graph.schema_generation() < generation,
            UpgradeMode::Force => true,
        };
        if !needed {
            return Ok(graph);
        }

        let from = graph.schema_generation();
        let version = graph.version().copied();
        let mut upgraded = self.upgrader.upgrade(graph, generation).map_err(Error::SchemaUpgrade)?;
        if upgraded.schema_generation() < generation {
            upgraded.set_schema_generation(generation);
        }
        if let Some(version) = version {
            upgraded.set_version(version);
        }
        debug!("Upgraded {} from schema generation {} to {}", key, from, generation);
        Ok(upgraded)
    }

    fn write_graph(&self, session: &StorageSession, handle: &GraphHandle) -> Result<FileVersion> {
        self.check_session(session)?;
        handle.ensure_open()?;
        if !session.owns_handle(handle) {
            return Err(ContractViolation::ForeignSession { session: handle.session_id().to_string() }.into());
        }
        if !handle.mode().allows_write() {
            return Err(ContractViolation::ReadOnlyAccess {
                key: handle.key().to_string(),
                mode: handle.mode().to_string(),
            }
            .into());
        }

        let key = handle.key();
        let graph = handle.graph();
        let (version, schema_generation) = {
            let current = graph.read();
            let expected = current.version().copied();
            let version = self
                .driver
                .write(key, expected.as_ref(), |out| self.codec.encode(&current, out))?;
            (version, current.schema_generation())
        };
        graph.mark_persisted(version);

        if handle.mode().is_managed() {
            if !self.cache.update_version(key, graph, version) {
                self.cache.put(
                    key.clone(),
                    CacheEntry {
                        graph: graph.clone(),
                        version,
                        schema_generation,
                        project_generation: self.schemas.generation(key.project()),
                    },
                );
            }
        } else {
            // The cached instance no longer matches the file
            self.cache.invalidate(key);
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureValue;
    use tempfile::tempdir;

    fn key() -> DocumentKey {
        DocumentKey::from_parts(3, 14, "anna").unwrap()
    }

    fn tokens() -> Result<AnnotationGraph> {
        let mut graph = AnnotationGraph::new(0);
        graph.add_annotation("token", 0, 5);
        Ok(graph)
    }

    #[test]
    fn initializer_runs_once_and_persists_immediately() {
        let dir = tempdir().unwrap();
        let service = AnnotationStorageService::new(&StorageConfig::with_data_dir(dir.path())).unwrap();
        let session = service.open_session(false).unwrap();

        let handle = service
            .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, tokens)
            .unwrap();
        assert!(service.exists(&key()));
        assert_eq!(handle.version(), service.driver().version(&key()).unwrap());

        let again = service
            .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, || {
                panic!("initializer must not run for an existing graph")
            })
            .unwrap();
        assert!(again.same_instance(&handle));
    }

    #[test]
    fn read_of_missing_graph_is_not_found() {
        let dir = tempdir().unwrap();
        let service = AnnotationStorageService::new(&StorageConfig::with_data_dir(dir.path())).unwrap();
        let session = service.open_session(false).unwrap();
        let err = service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap_err();
        assert!(err.is_not_found());
        // The failed acquisition does not keep the key locked
        assert!(service.delete(&session, &key()).is_ok());
    }

    #[test]
    fn modify_write_and_reload() {
        let dir = tempdir().unwrap();
        let service = AnnotationStorageService::new(&StorageConfig::with_data_dir(dir.path())).unwrap();
        {
            let session = service.open_session(false).unwrap();
            let mut handle = service
                .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, tokens)
                .unwrap();
            {
                let mut graph = handle.write().unwrap();
                let id = graph.add_annotation("pos", 0, 5);
                graph.set_feature(id, "value", FeatureValue::Text("NOUN".into()));
            }
            assert!(handle.is_modified());
            let version = service.write(&session, &handle).unwrap();
            assert!(!handle.is_modified());
            assert_eq!(handle.version(), Some(version));
        }

        let graph = service.inspect(&key()).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.select("pos").count(), 1);
    }

    #[test]
    fn writing_through_a_shared_handle_is_refused() {
        let dir = tempdir().unwrap();
        let service = AnnotationStorageService::new(&StorageConfig::with_data_dir(dir.path())).unwrap();
        let session = service.open_session(false).unwrap();
        let handle = service
            .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::SharedReadOnly, tokens)
            .unwrap();
        let err = service.write(&session, &handle).unwrap_err();
        assert!(matches!(err, Error::Contract(ContractViolation::ReadOnlyAccess { .. })));
    }

    #[test]
    fn upgrader_errors_pass_through() {
        let dir = tempdir().unwrap();
        let failing = |_: AnnotationGraph, _: u64| -> std::result::Result<AnnotationGraph, crate::types::BoxError> {
            Err("layer 'pos' was removed".into())
        };
        let service = AnnotationStorageService::new(&StorageConfig::with_data_dir(dir.path()))
            .unwrap()
            .with_upgrader(Arc::new(failing));
        {
            let session = service.open_session(false).unwrap();
            service
                .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, tokens)
                .unwrap();
        }

        service.schema_changed(key().project());
        let session = service.open_session(false).unwrap();
        let err = service.read(&session, &key(), AccessMode::ExclusiveWrite).unwrap_err();
        assert!(matches!(err, Error::SchemaUpgrade(_)));
        assert!(err.to_string().contains("layer 'pos' was removed"));
    }
}
