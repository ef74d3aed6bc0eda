//! Scope guard and the per-thread context switch protocol
//!
//! `enter` resolves or creates a node in the calling thread's private tree
//! and makes it current; dropping the guard moves the cursor back to the
//! parent on every exit path, including unwinding. Neither operation reads a
//! clock - timing comes entirely from the sampling engine.
//!
//! The thread's state is registered on first entry and merged into the
//! master tree when the thread terminates, via the `thread_local!` handle's
//! destructor.

use crate::call_site::CallSiteToken;
use crate::context::ContextToken;
use crate::lock;
use crate::profiler::Profiler;
use crate::registry::ThreadState;
use crate::tree::NodeId;
use std::sync::Arc;

struct ThreadHandle {
    state: Arc<ThreadState>,
}

impl ThreadHandle {
    fn new() -> Self {
        ThreadHandle {
            state: Profiler::global().on_thread_start(),
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        Profiler::global().on_thread_stop(&self.state);
    }
}

thread_local! {
    static THREAD_HANDLE: ThreadHandle = ThreadHandle::new();
}

/// The calling thread's state, or `None` during thread teardown.
fn thread_state() -> Option<Arc<ThreadState>> {
    THREAD_HANDLE.try_with(|h| h.state.clone()).ok()
}

/// RAII handle for one instrumented scope.
///
/// Created by [`profile_scope!`](crate::profile_scope); exit happens in
/// `Drop`, so early returns and propagating panics still restore the
/// context cursor.
pub struct ScopeGuard {
    slot: Option<(Arc<ThreadState>, NodeId, u64)>,
}

impl ScopeGuard {
    /// Enter the scope identified by `token`, descending the thread's tree.
    ///
    /// During thread teardown (the thread-local state is already destroyed)
    /// this degrades to an inert guard and the scope goes unmeasured.
    pub fn enter(
        token: CallSiteToken,
        file: &'static str,
        line: u32,
        function: &'static str,
        name: Option<&str>,
    ) -> ScopeGuard {
        let Some(state) = thread_state() else {
            return ScopeGuard { slot: None };
        };
        let (node, generation) = {
            let mut tree = lock(&state.tree);
            let node = tree.enter(token, file, line, function, name);
            (node, tree.generation())
        };
        ScopeGuard {
            slot: Some((state, node, generation)),
        }
    }

    /// Node this guard is measuring, if any.
    pub fn node(&self) -> Option<NodeId> {
        self.slot.as_ref().map(|(_, node, _)| *node)
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some((state, _node, generation)) = self.slot.take() {
            let mut tree = lock(&state.tree);
            // A shutdown drain may have swapped the tree out from under a
            // still-active scope; the stale guard has nothing left to exit.
            if tree.generation() == generation {
                tree.exit();
            }
        }
    }
}

/// Fingerprint of the calling thread's current call context.
///
/// `None` only while the thread's profiler state is being torn down.
pub fn current_context() -> Option<ContextToken> {
    let state = thread_state()?;
    let tree = lock(&state.tree);
    let current = tree.current();
    Some(tree.node(current).frame().clone())
}

/// Charge allocated bytes to the current node and capture its context.
pub(crate) fn charge_allocation(bytes: u64) -> Option<ContextToken> {
    let state = thread_state()?;
    let mut tree = lock(&state.tree);
    let current = tree.current();
    tree.node_mut(current).totals.bytes_allocated += bytes;
    Some(tree.node(current).frame().clone())
}

/// Charge freed bytes to the current node. Best-effort during teardown.
pub(crate) fn charge_deallocation(bytes: u64) {
    if let Some(state) = thread_state() {
        let mut tree = lock(&state.tree);
        let current = tree.current();
        tree.node_mut(current).totals.bytes_freed += bytes;
    }
}

/// Instrument the enclosing scope.
///
/// `profile_scope!()` labels the node with the enclosing function's path;
/// `profile_scope!("name")` appends the quoted name. The guard is bound to a
/// hidden local and released at the end of the scope.
#[macro_export]
macro_rules! profile_scope {
    () => {
        let _centinela_scope = $crate::scope::ScopeGuard::enter(
            $crate::call_site!(),
            file!(),
            line!(),
            $crate::function_path!(),
            None,
        );
    };
    ($name:expr) => {
        let _centinela_scope = $crate::scope::ScopeGuard::enter(
            $crate::call_site!(),
            file!(),
            line!(),
            $crate::function_path!(),
            Some($name),
        );
    };
}
