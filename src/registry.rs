//! Thread-local registry of per-thread profiler state
//!
//! One `ThreadState` exists per live instrumented thread, created lazily on
//! the thread's first scope entry and dropped from the registry when the
//! thread terminates (or when the profiler drains live trees at shutdown).
//!
//! The registry lock is the shared/exclusive "soft lock" of the design: the
//! sampling engine enumerates live threads under the shared side while
//! thread start/stop takes the exclusive side. It is never upgraded in
//! place.

use crate::tree::CallTree;
use fnv::FnvHashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::ThreadId;
use tracing::debug;

/// Profiler state owned by one thread: its private call tree and cursor.
///
/// The mutex is uncontended on the hot path - only the owning thread mutates
/// the tree during normal execution. The sampler takes `try_lock` and skips
/// on contention; the merge phase locks it exactly once, at teardown.
#[derive(Debug)]
pub(crate) struct ThreadState {
    thread: ThreadId,
    pub(crate) tree: Mutex<CallTree>,
}

impl ThreadState {
    pub(crate) fn new(thread: ThreadId, application_name: &str) -> Self {
        ThreadState {
            thread,
            tree: Mutex::new(CallTree::new(application_name)),
        }
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Charge one sampling tick to whichever node is current. Best-effort:
    /// a contended tree loses this one sample rather than blocking anyone.
    pub(crate) fn charge_sample(&self, elapsed_ms: u64) {
        if let Ok(mut tree) = self.tree.try_lock() {
            let current = tree.current();
            tree.node_mut(current).totals.runtime_ms += elapsed_ms;
        }
    }
}

/// Registry of all live per-thread states.
#[derive(Debug, Default)]
pub(crate) struct ThreadRegistry {
    threads: RwLock<FnvHashMap<ThreadId, Arc<ThreadState>>>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, state: Arc<ThreadState>) {
        let mut threads = self
            .threads
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug!(thread = ?state.thread_id(), live = threads.len() + 1, "thread registered");
        threads.insert(state.thread_id(), state);
    }

    pub(crate) fn deregister(&self, thread: ThreadId) -> Option<Arc<ThreadState>> {
        let mut threads = self
            .threads
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = threads.remove(&thread);
        debug!(?thread, live = threads.len(), "thread deregistered");
        state
    }

    /// Visit every live state under the shared lock. Additions and removals
    /// block for the duration of the walk; the walk itself never blocks on
    /// individual trees.
    pub(crate) fn for_each_live<F: FnMut(&Arc<ThreadState>)>(&self, mut f: F) {
        let threads = self
            .threads
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for state in threads.values() {
            f(state);
        }
    }

    /// Snapshot of the live states, for the shutdown drain.
    pub(crate) fn live_states(&self) -> Vec<Arc<ThreadState>> {
        let threads = self
            .threads
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        threads.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.threads
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
