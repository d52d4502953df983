//! Storage sessions
//!
//! A [`StorageSession`] is the unit of work every acquisition belongs to. It
//! records each graph acquired through it together with the access mode, and
//! on close (explicit or on drop, including during a panic) it releases the
//! session's locks and drops its references. Graphs modified under exclusive
//! access but never written are evicted from the cache at that point.
//!
//! Sessions are bound to the thread that opened them and are `!Send`. Each
//! thread holds at most one open session per service. A nested open on a
//! thread that already has a session with the same service joins that
//! session; only the outermost guard closes it. Sessions of different
//! services on one thread are independent.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;
use crate::storage::access::{AccessController, AccessMode, LockGrant};
use crate::storage::cache::{AnnotationGraphCache, SharedGraph};
use crate::system::metrics::Metrics;
use crate::types::{AnnotationGraph, ContractViolation, DocumentKey, FileVersion, Result};

thread_local! {
    static CURRENT: RefCell<Vec<Arc<SessionInner>>> = const { RefCell::new(Vec::new()) };
}

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

struct Resource {
    key: DocumentKey,
    mode: AccessMode,
    graph: SharedGraph,
}

pub(crate) struct SessionInner {
    id: SessionId,
    owner: ThreadId,
    closed: AtomicBool,
    resources: Mutex<Vec<Resource>>,
    locked: Mutex<Vec<DocumentKey>>,
    controller: Arc<AccessController>,
    cache: Arc<AnnotationGraphCache>,
    metrics: Option<&'static Metrics>,
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ContractViolation::SessionClosed { session: self.id.to_string() }.into());
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Evict unpersisted modifications before anyone else can lock the key
        let resources = std::mem::take(&mut *self.resources.lock());
        for resource in &resources {
            if resource.mode == AccessMode::ExclusiveWrite && resource.graph.is_modified() {
                self.cache.invalidate_instance(&resource.key, &resource.graph);
            }
        }
        drop(resources);

        let locked = std::mem::take(&mut *self.locked.lock());
        for key in &locked {
            self.controller.release(key, self.id);
        }

        if let Some(metrics) = self.metrics {
            metrics.sessions.open_sessions.dec();
        }
        debug!("Closed session {} ({} locks released)", self.id, locked.len());
    }
}

/// Scoped unit of work. Closing is idempotent and happens on drop.
pub struct StorageSession {
    inner: Arc<SessionInner>,
    owns: bool,
    _not_send: PhantomData<*const ()>,
}

impl StorageSession {
    pub(crate) fn open(
        controller: &Arc<AccessController>,
        cache: &Arc<AnnotationGraphCache>,
        metrics: Option<&'static Metrics>,
        nested: bool,
    ) -> Result<Self> {
        CURRENT.with(|current| -> Result<Self> {
            let mut current = current.borrow_mut();
            current.retain(|s| !s.is_closed());
            if let Some(existing) = current.iter().find(|s| Arc::ptr_eq(&s.controller, controller)) {
                if !nested {
                    return Err(ContractViolation::SessionAlreadyOpen { session: existing.id.to_string() }.into());
                }
                debug!("Joined session {}", existing.id);
                return Ok(Self {
                    inner: existing.clone(),
                    owns: false,
                    _not_send: PhantomData,
                });
            }

            let inner = Arc::new(SessionInner {
                id: SessionId::new(),
                owner: thread::current().id(),
                closed: AtomicBool::new(false),
                resources: Mutex::new(Vec::new()),
                locked: Mutex::new(Vec::new()),
                controller: controller.clone(),
                cache: cache.clone(),
                metrics,
            });
            if let Some(metrics) = metrics {
                metrics.sessions.open_sessions.inc();
            }
            debug!("Opened session {}", inner.id);
            current.push(inner.clone());
            Ok(Self {
                inner,
                owns: true,
                _not_send: PhantomData,
            })
        })
    }

    /// Identifier of the session open on the current thread for `controller`
    pub(crate) fn current_id(controller: &Arc<AccessController>) -> Option<SessionId> {
        CURRENT
            .try_with(|current| {
                current
                    .borrow()
                    .iter()
                    .find(|s| !s.is_closed() && Arc::ptr_eq(&s.controller, controller))
                    .map(|s| s.id)
            })
            .ok()
            .flatten()
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// True if this guard joined a session opened further out
    pub fn is_nested(&self) -> bool {
        !self.owns
    }

    /// True once the session has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of acquisitions recorded in the session
    pub fn resource_count(&self) -> usize {
        self.inner.resources.lock().len()
    }

    /// Record an acquisition of `graph` for `key` in `mode`
    pub fn register_resource(&self, key: &DocumentKey, mode: AccessMode, graph: &SharedGraph) -> Result<()> {
        self.ensure_usable()?;
        self.inner.resources.lock().push(Resource {
            key: key.clone(),
            mode,
            graph: graph.clone(),
        });
        Ok(())
    }

    /// Close the session: release locks and drop references. Closing a
    /// nested guard leaves the session open for the outer guard.
    pub fn close(&mut self) {
        if !self.owns {
            return;
        }
        self.inner.close();
        let _ = CURRENT.try_with(|current| {
            current.borrow_mut().retain(|s| !Arc::ptr_eq(s, &self.inner));
        });
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        self.inner.ensure_open()?;
        if self.inner.owner != thread::current().id() {
            return Err(ContractViolation::WrongThread { session: self.inner.id.to_string() }.into());
        }
        Ok(())
    }

    pub(crate) fn belongs_to(&self, controller: &Arc<AccessController>) -> bool {
        Arc::ptr_eq(&self.inner.controller, controller)
    }

    /// Take the lock for `key` in `mode` and remember it for release on close
    pub(crate) fn lock(&self, key: &DocumentKey, mode: AccessMode) -> Result<LockGrant> {
        let grant = self.inner.controller.acquire(key, mode, self.inner.id)?;
        if grant == LockGrant::Acquired {
            self.inner.locked.lock().push(key.clone());
        }
        Ok(grant)
    }

    /// Give back a lock taken by [`StorageSession::lock`] whose acquisition failed
    pub(crate) fn unlock(&self, key: &DocumentKey) {
        self.inner.locked.lock().retain(|k| k != key);
        self.inner.controller.release(key, self.inner.id);
    }

    /// A graph this session already acquired for `key` in a mode that covers `mode`
    pub(crate) fn find_resource(&self, key: &DocumentKey, mode: AccessMode) -> Option<(AccessMode, SharedGraph)> {
        self.inner
            .resources
            .lock()
            .iter()
            .rev()
            .find(|r| &r.key == key && r.mode.satisfies(mode))
            .map(|r| (r.mode, r.graph.clone()))
    }

    /// Forget every recorded acquisition of `key`
    pub(crate) fn forget(&self, key: &DocumentKey) {
        self.inner.resources.lock().retain(|r| &r.key != key);
    }

    pub(crate) fn handle(&self, key: &DocumentKey, mode: AccessMode, graph: SharedGraph) -> GraphHandle {
        GraphHandle {
            key: key.clone(),
            mode,
            graph,
            session: self.inner.clone(),
        }
    }

    pub(crate) fn owns_handle(&self, handle: &GraphHandle) -> bool {
        Arc::ptr_eq(&self.inner, &handle.session)
    }
}

impl Drop for StorageSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for StorageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSession")
            .field("id", &self.inner.id)
            .field("nested", &!self.owns)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

/// A graph acquired through a session. Access fails once the session closed.
pub struct GraphHandle {
    key: DocumentKey,
    mode: AccessMode,
    graph: SharedGraph,
    session: Arc<SessionInner>,
}

impl GraphHandle {
    /// Key the graph was acquired for
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Mode the graph was acquired in
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Identifier of the owning session
    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    /// Read the graph
    pub fn read(&self) -> Result<RwLockReadGuard<'_, AnnotationGraph>> {
        self.session.ensure_open()?;
        Ok(self.graph.read())
    }

    /// Modify the graph. Only exclusive and unmanaged acquisitions may do so.
    pub fn write(&mut self) -> Result<RwLockWriteGuard<'_, AnnotationGraph>> {
        self.session.ensure_open()?;
        if !self.mode.allows_write() {
            return Err(ContractViolation::ReadOnlyAccess {
                key: self.key.to_string(),
                mode: self.mode.to_string(),
            }
            .into());
        }
        Ok(self.graph.write())
    }

    /// True if the graph changed since it was loaded or last written
    pub fn is_modified(&self) -> bool {
        self.graph.is_modified()
    }

    /// File version the graph corresponds to
    pub fn version(&self) -> Option<FileVersion> {
        self.graph.version()
    }

    /// True if both handles refer to the same in-memory instance
    pub fn same_instance(&self, other: &GraphHandle) -> bool {
        Arc::ptr_eq(&self.graph, &other.graph)
    }

    pub(crate) fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        self.session.ensure_open()
    }
}

impl fmt::Debug for GraphHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphHandle")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("session", &self.session.id)
            .finish()
    }
}
