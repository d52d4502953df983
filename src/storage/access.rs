//! Per-key access control
//!
//! Reader/writer tokens keyed by [`DocumentKey`] and owned by sessions rather
//! than threads, so a session can re-enter its own locks and release them all
//! at once when it closes.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::debug;
use crate::storage::session::SessionId;
use crate::system::metrics::Metrics;
use crate::types::{ContractViolation, DocumentKey, Result};

/// How a graph is acquired. Fixed for the lifetime of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// One holder system-wide; may modify and write the graph
    ExclusiveWrite,
    /// Any number of concurrent holders while nobody holds the key exclusively
    SharedReadOnly,
    /// No lock; creates the file through the initializer when absent
    Unmanaged,
    /// No lock; a missing file is reported as not found
    UnmanagedNonInitializing,
}

impl AccessMode {
    /// True for modes that take a lock and go through the cache
    pub fn is_managed(self) -> bool {
        matches!(self, AccessMode::ExclusiveWrite | AccessMode::SharedReadOnly)
    }

    /// True if a missing file is created through the initializer
    pub fn initializes(self) -> bool {
        !matches!(self, AccessMode::UnmanagedNonInitializing)
    }

    /// True if graphs acquired in this mode may be modified and written
    pub fn allows_write(self) -> bool {
        matches!(self, AccessMode::ExclusiveWrite | AccessMode::Unmanaged)
    }

    /// True if an acquisition in `self` can stand in for a request for `requested`
    pub(crate) fn satisfies(self, requested: AccessMode) -> bool {
        match requested {
            AccessMode::ExclusiveWrite => self == AccessMode::ExclusiveWrite,
            AccessMode::SharedReadOnly => self.is_managed(),
            AccessMode::Unmanaged | AccessMode::UnmanagedNonInitializing => self == requested,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessMode::ExclusiveWrite => "exclusive-write",
            AccessMode::SharedReadOnly => "shared-read-only",
            AccessMode::Unmanaged => "unmanaged",
            AccessMode::UnmanagedNonInitializing => "unmanaged-non-initializing",
        };
        f.write_str(name)
    }
}

/// Result of an acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// A new hold was taken; the session must release it on close
    Acquired,
    /// The session already held a sufficient lock
    Reentered,
    /// The mode takes no lock
    Unlocked,
}

#[derive(Default)]
struct LockState {
    writer: Option<SessionId>,
    readers: HashSet<SessionId>,
}

impl LockState {
    fn is_idle(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

#[derive(Default)]
struct KeyLock {
    state: Mutex<LockState>,
    released: Condvar,
}

/// Lock table implementing the access-mode contract
pub struct AccessController {
    locks: DashMap<DocumentKey, Arc<KeyLock>>,
    metrics: Option<&'static Metrics>,
}

impl AccessController {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            metrics: None,
        }
    }

    /// Count lock waits in the global metrics
    pub fn with_metrics(mut self, metrics: &'static Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Acquire `key` in `mode` on behalf of `session`, blocking until
    /// compatible access is available.
    ///
    /// Requesting exclusive access to a key the session holds shared is a
    /// contract violation: it could never be granted while the session waits.
    pub fn acquire(&self, key: &DocumentKey, mode: AccessMode, session: SessionId) -> Result<LockGrant> {
        let exclusive = match mode {
            AccessMode::ExclusiveWrite => true,
            AccessMode::SharedReadOnly => false,
            AccessMode::Unmanaged | AccessMode::UnmanagedNonInitializing => return Ok(LockGrant::Unlocked),
        };

        let lock = self.locks.entry(key.clone()).or_default().clone();
        let mut state = lock.state.lock();

        if state.writer == Some(session) {
            return Ok(LockGrant::Reentered);
        }
        if state.readers.contains(&session) {
            if exclusive {
                return Err(ContractViolation::LockUpgrade { key: key.to_string() }.into());
            }
            return Ok(LockGrant::Reentered);
        }

        let mut waited = false;
        while state.writer.is_some() || (exclusive && !state.readers.is_empty()) {
            if !waited {
                waited = true;
                debug!("Session {} waits for {} access to {}", session, mode, key);
                if let Some(metrics) = self.metrics {
                    metrics.sessions.lock_waits.inc();
                }
            }
            lock.released.wait(&mut state);
        }

        if exclusive {
            state.writer = Some(session);
        } else {
            state.readers.insert(session);
        }
        debug!("Session {} holds {} access to {}", session, mode, key);
        Ok(LockGrant::Acquired)
    }

    /// Release every hold `session` has on `key` and wake waiting sessions
    pub fn release(&self, key: &DocumentKey, session: SessionId) {
        let Some(lock) = self.locks.get(key).map(|entry| entry.value().clone()) else {
            return;
        };
        {
            let mut state = lock.state.lock();
            if state.writer == Some(session) {
                state.writer = None;
            }
            state.readers.remove(&session);
        }
        lock.released.notify_all();
        drop(lock);

        // Drop the entry once nobody holds or waits on it
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1 && lock.state.lock().is_idle());
    }

    /// True if any session holds `key`
    pub fn is_locked(&self, key: &DocumentKey) -> bool {
        self.locks
            .get(key)
            .map_or(false, |entry| !entry.value().state.lock().is_idle())
    }

    /// Number of keys with a lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no key has a lock entry
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for AccessController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn key() -> DocumentKey {
        DocumentKey::from_parts(1, 1, "anna").unwrap()
    }

    #[test]
    fn unmanaged_modes_take_no_lock() {
        let controller = AccessController::new();
        let grant = controller.acquire(&key(), AccessMode::Unmanaged, SessionId::new()).unwrap();
        assert_eq!(grant, LockGrant::Unlocked);
        assert!(controller.is_empty());
    }

    #[test]
    fn locks_are_reentrant_within_a_session() {
        let controller = AccessController::new();
        let session = SessionId::new();
        assert_eq!(controller.acquire(&key(), AccessMode::ExclusiveWrite, session).unwrap(), LockGrant::Acquired);
        assert_eq!(controller.acquire(&key(), AccessMode::ExclusiveWrite, session).unwrap(), LockGrant::Reentered);
        assert_eq!(controller.acquire(&key(), AccessMode::SharedReadOnly, session).unwrap(), LockGrant::Reentered);
        controller.release(&key(), session);
        assert!(!controller.is_locked(&key()));
        assert!(controller.is_empty());
    }

    #[test]
    fn upgrading_shared_to_exclusive_fails_fast() {
        let controller = AccessController::new();
        let session = SessionId::new();
        controller.acquire(&key(), AccessMode::SharedReadOnly, session).unwrap();
        let err = controller.acquire(&key(), AccessMode::ExclusiveWrite, session).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn shared_holders_coexist() {
        let controller = AccessController::new();
        let (a, b) = (SessionId::new(), SessionId::new());
        controller.acquire(&key(), AccessMode::SharedReadOnly, a).unwrap();
        controller.acquire(&key(), AccessMode::SharedReadOnly, b).unwrap();
        controller.release(&key(), a);
        assert!(controller.is_locked(&key()));
        controller.release(&key(), b);
        assert!(!controller.is_locked(&key()));
    }

    #[test]
    fn exclusive_waits_for_release() {
        let controller = Arc::new(AccessController::new());
        let holder = SessionId::new();
        controller.acquire(&key(), AccessMode::ExclusiveWrite, holder).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let controller = controller.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let session = SessionId::new();
                controller.acquire(&key(), AccessMode::ExclusiveWrite, session).unwrap();
                acquired.store(true, Ordering::SeqCst);
                controller.release(&key(), session);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        controller.release(&key(), holder);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn shared_waits_for_exclusive_holder() {
        let controller = Arc::new(AccessController::new());
        let holder = SessionId::new();
        controller.acquire(&key(), AccessMode::ExclusiveWrite, holder).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let reader = {
            let controller = controller.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                controller.acquire(&key(), AccessMode::SharedReadOnly, SessionId::new()).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        controller.release(&key(), holder);
        reader.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
