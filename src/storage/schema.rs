//! Schema generations, change events and upgrades
//!
//! The surrounding platform owns layer and feature definitions. The store only
//! tracks a generation counter per project: every schema change bumps it and
//! publishes a [`SchemaChanged`] event that the cache consumes.

use dashmap::DashMap;
use flume::{Receiver, Sender};
use tracing::info;
use crate::types::{AnnotationGraph, BoxError, ProjectId};

/// Published whenever a project's layers or features change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaChanged {
    /// Project whose schema changed
    pub project: ProjectId,
    /// Generation after the change
    pub generation: u64,
}

/// Upgrade policy of an acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradeMode {
    /// Use the graph as stored
    No,
    /// Upgrade graphs built against an older generation
    #[default]
    Auto,
    /// Reload and upgrade regardless of cache state or generation
    Force,
}

/// Brings a graph up to the project's current schema
pub trait SchemaUpgrader: Send + Sync {
    /// Return `graph` rewritten against `target_generation`. Errors are passed
    /// to the caller unchanged.
    fn upgrade(&self, graph: AnnotationGraph, target_generation: u64) -> Result<AnnotationGraph, BoxError>;
}

/// Upgrader for schemas whose changes never invalidate stored content: it only
/// restamps the generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestampUpgrader;

impl SchemaUpgrader for RestampUpgrader {
    fn upgrade(&self, mut graph: AnnotationGraph, target_generation: u64) -> Result<AnnotationGraph, BoxError> {
        graph.set_schema_generation(target_generation);
        Ok(graph)
    }
}

impl<F> SchemaUpgrader for F
where
    F: Fn(AnnotationGraph, u64) -> Result<AnnotationGraph, BoxError> + Send + Sync,
{
    fn upgrade(&self, graph: AnnotationGraph, target_generation: u64) -> Result<AnnotationGraph, BoxError> {
        self(graph, target_generation)
    }
}

/// Current schema generation per project
pub struct SchemaRegistry {
    generations: DashMap<ProjectId, u64>,
    events: Sender<SchemaChanged>,
}

impl SchemaRegistry {
    /// Create a registry and the receiving end of its change events
    pub fn new() -> (Self, Receiver<SchemaChanged>) {
        let (events, receiver) = flume::unbounded();
        let registry = Self {
            generations: DashMap::new(),
            events,
        };
        (registry, receiver)
    }

    /// Current generation of `project`; projects start at generation 0
    pub fn generation(&self, project: ProjectId) -> u64 {
        self.generations.get(&project).map_or(0, |g| *g.value())
    }

    /// Seed the generation of `project`, e.g. from the platform's own records
    /// at startup. Does not publish an event.
    pub fn set_generation(&self, project: ProjectId, generation: u64) {
        self.generations.insert(project, generation);
    }

    /// Record a schema change and notify subscribers
    pub fn schema_changed(&self, project: ProjectId) -> u64 {
        let generation = {
            let mut entry = self.generations.entry(project).or_insert(0);
            *entry += 1;
            *entry
        };
        info!("Schema of project {} changed, now generation {}", project, generation);
        // A closed channel only means nobody caches graphs any more
        let _ = self.events.send(SchemaChanged { project, generation });
        generation
    }
}
