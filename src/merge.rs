//! Tree merge, recursion collapse, and the time cascade
//!
//! Three passes run over a thread's tree when its measurements become final:
//!
//! 1. [`collapse_recursion`] - folds recursive invocations (same token on
//!    both ends of an ancestor/descendant pair) into the ancestor, so
//!    recursion depth is represented by counters instead of tree depth.
//! 2. [`merge_tree`] - sums the collapsed tree into the master, transferring
//!    subtrees the master has never seen.
//! 3. [`cascade_timings`] - post-order summation turning disjoint per-node
//!    self times into inclusive times, rolling byte counters up alongside,
//!    optionally de-biased by the pre-measured instrumentation overhead.
//!
//! The cascade must run exactly once per tree; running it twice double-counts
//! every descendant.

use crate::tree::{CallTree, NodeId};

/// Pre-measured instrumentation overhead, in milliseconds per invocation.
///
/// `self_ms_per_call` is the cost a scope charges to its own measurement;
/// `contained_ms_per_call` is the cost it leaks into its parent's. Both come
/// from startup calibration and are approximations bounded by measurement
/// noise.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverheadEstimate {
    pub self_ms_per_call: f64,
    pub contained_ms_per_call: f64,
}

/// Fold every recursive invocation chain in `tree` into its outermost node.
///
/// Afterwards no token appears as both an ancestor and a descendant of
/// itself; the folded node's completed `calls` are accounted as
/// `nested_calls` on the surviving ancestor.
pub fn collapse_recursion(tree: &mut CallTree) {
    let root = tree.root();
    collapse_node(tree, root);
}

/// Returns true when `id` was folded into an ancestor and unlinked by the
/// caller's sibling walk.
fn collapse_node(tree: &mut CallTree, id: NodeId) -> bool {
    // Children first, so every descendant has already been checked against
    // the full ancestor chain (which includes this node).
    let mut child = tree.node(id).first_child;
    while let Some(cid) = child {
        let next = tree.node(cid).next_sibling;
        if collapse_node(tree, cid) {
            tree.unlink_child(id, cid);
        }
        child = next;
    }

    let Some(token) = tree.node(id).token else {
        return false; // root
    };
    let mut ancestor = tree.node(id).parent;
    while let Some(a) = ancestor {
        if tree.node(a).token == Some(token) {
            let calls = tree.node(id).totals.calls;
            tree.node_mut(id).totals.nested_calls += calls;
            tree.node_mut(id).totals.calls = 0;
            merge_into(tree, a, id);
            return true;
        }
        ancestor = tree.node(a).parent;
    }
    false
}

/// Merge `source` into `target` within one arena: counters are summed, and
/// each source child either merges into the matching target child or is
/// relinked wholesale under the target.
pub(crate) fn merge_into(tree: &mut CallTree, target: NodeId, source: NodeId) {
    let totals = tree.node(source).totals.clone();
    let t = &mut tree.node_mut(target).totals;
    t.calls += totals.calls;
    t.nested_calls += totals.nested_calls;
    t.runtime_ms += totals.runtime_ms;
    t.bytes_allocated += totals.bytes_allocated;
    t.bytes_freed += totals.bytes_freed;

    let mut child = tree.node_mut(source).first_child.take();
    while let Some(cid) = child {
        let next = tree.node_mut(cid).next_sibling.take();
        let token = tree
            .node(cid)
            .token
            .expect("child nodes always carry a token");
        match tree.find_child(target, token) {
            Some(existing) => merge_into(tree, existing, cid),
            None => {
                // Steal the subtree: relink as the target's new head child.
                let head = tree.node(target).first_child;
                tree.node_mut(cid).parent = Some(target);
                tree.node_mut(cid).next_sibling = head;
                tree.node_mut(target).first_child = Some(cid);
            }
        }
        child = next;
    }
}

/// Merge a finished thread tree into the master, root onto root.
///
/// Commutative on the counter sums: merging trees A then B yields the same
/// totals at every matching node as B then A (sibling order may differ).
pub fn merge_tree(master: &mut CallTree, source: &CallTree) {
    merge_nodes(master, master.root(), source, source.root());
}

fn merge_nodes(master: &mut CallTree, target: NodeId, source: &CallTree, from: NodeId) {
    let totals = &source.node(from).totals;
    let t = &mut master.node_mut(target).totals;
    t.calls += totals.calls;
    t.nested_calls += totals.nested_calls;
    t.runtime_ms += totals.runtime_ms;
    t.bytes_allocated += totals.bytes_allocated;
    t.bytes_freed += totals.bytes_freed;

    let mut child = source.node(from).first_child;
    while let Some(cid) = child {
        let token = source
            .node(cid)
            .token
            .expect("child nodes always carry a token");
        let target_child = match master.find_child(target, token) {
            Some(existing) => existing,
            None => master.adopt(target, source.node(cid)),
        };
        merge_nodes(master, target_child, source, cid);
        child = source.node(cid).next_sibling;
    }
}

/// Turn per-node self times into inclusive times and roll byte counters up
/// the tree. Runs once, when a tree's measurements are final.
///
/// With an [`OverheadEstimate`], each node's time is additionally reduced by
/// its invocation count times the calibrated per-call overhead, saturating
/// at zero.
pub fn cascade_timings(tree: &mut CallTree, overhead: Option<&OverheadEstimate>) {
    let root = tree.root();
    cascade(tree, root, overhead);
}

/// Returns the runtime contribution this subtree reports to its parent
/// (inclusive time minus contained overhead, when correction is on).
fn cascade(tree: &mut CallTree, id: NodeId, overhead: Option<&OverheadEstimate>) -> u64 {
    let mut child_runtime = 0u64;
    let mut child_allocated = 0u64;
    let mut child_freed = 0u64;

    let mut child = tree.node(id).first_child;
    while let Some(cid) = child {
        child_runtime += cascade(tree, cid, overhead);
        let totals = &tree.node(cid).totals;
        child_allocated += totals.bytes_allocated;
        child_freed += totals.bytes_freed;
        child = tree.node(cid).next_sibling;
    }

    let node = tree.node_mut(id);
    node.totals.bytes_allocated += child_allocated;
    node.totals.bytes_freed += child_freed;
    node.totals.runtime_ms += child_runtime;

    match overhead {
        Some(estimate) => {
            let invocations = node.totals.calls + node.totals.nested_calls;
            let own = (invocations as f64 * estimate.self_ms_per_call) as u64;
            node.totals.runtime_ms = node.totals.runtime_ms.saturating_sub(own);
            let contained = (invocations as f64 * estimate.contained_ms_per_call) as u64;
            node.totals.runtime_ms.saturating_sub(contained)
        }
        None => node.totals.runtime_ms,
    }
}
