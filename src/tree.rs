//! Call-context node store
//!
//! An arena-backed tree of named timing/allocation nodes. Each node is keyed
//! among its siblings by the [`CallSiteToken`] that created it; the synthetic
//! root carries no token and represents the whole application.
//!
//! Node links (`parent`, `first_child`, `next_sibling`) are arena indices,
//! not pointers. Nodes unlinked during recursion collapse stay allocated in
//! the arena but become unreachable from the root; every traversal in this
//! crate starts at the root, so they are simply dead weight until the tree is
//! dropped.

use crate::call_site::CallSiteToken;
use crate::context::{ContextFrame, ContextToken};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Index of a node within one [`CallTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Aggregated measurement counters of one node.
///
/// All counters are monotonically non-decreasing until the tree is merged or
/// cascaded. Before the time cascade runs, `runtime_ms` holds self time only;
/// afterwards it is inclusive of all descendants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTotals {
    /// Completed top-level invocations (reentrancy depth 0 -> 1).
    pub calls: u64,
    /// Invocations entered while already active (recursive or reentrant).
    pub nested_calls: u64,
    /// Sampled wall time in milliseconds.
    pub runtime_ms: u64,
    /// Bytes charged by the allocation tracker while this node was current.
    pub bytes_allocated: u64,
    /// Bytes released while this node was current.
    pub bytes_freed: u64,
}

/// One position in the call tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) token: Option<CallSiteToken>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) first_child: Option<NodeId>,
    pub(crate) next_sibling: Option<NodeId>,
    /// Human-readable label; `function` or `function "name"`.
    pub display_name: String,
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
    /// Owned ancestor-chain snapshot, shared with allocation records.
    pub(crate) frame: ContextToken,
    /// Reentrancy depth; > 0 while the scope is active on its thread.
    pub(crate) active_depth: u32,
    pub totals: NodeTotals,
}

impl Node {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn first_child(&self) -> Option<NodeId> {
        self.first_child
    }

    pub fn next_sibling(&self) -> Option<NodeId> {
        self.next_sibling
    }

    pub fn frame(&self) -> &ContextToken {
        &self.frame
    }
}

/// Arena-backed tree of call-context nodes plus the per-thread `current`
/// cursor the scope protocol walks.
#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<Node>,
    root: NodeId,
    current: NodeId,
    generation: u64,
}

impl CallTree {
    pub fn new(application_name: &str) -> Self {
        let frame = Arc::new(ContextFrame {
            label: application_name.to_string(),
            file: "",
            line: 0,
            function: "",
            parent: None,
        });
        let root = Node {
            token: None,
            parent: None,
            first_child: None,
            next_sibling: None,
            display_name: application_name.to_string(),
            file: "",
            line: 0,
            function: "",
            frame,
            active_depth: 0,
            totals: NodeTotals::default(),
        };
        CallTree {
            nodes: vec![root],
            root: NodeId(0),
            current: NodeId(0),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn current(&self) -> NodeId {
        self.current
    }

    /// Identity of this arena; changes when a thread's tree is drained and
    /// replaced, so stale scope guards can detect the swap.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Descend into the child of `current` identified by `token`, creating it
    /// on first visit. The created node becomes the new head of the sibling
    /// list; sibling order is not significant.
    pub fn enter(
        &mut self,
        token: CallSiteToken,
        file: &'static str,
        line: u32,
        function: &'static str,
        name: Option<&str>,
    ) -> NodeId {
        let id = match self.find_child(self.current, token) {
            Some(id) => id,
            None => {
                let display_name = match name {
                    Some(n) => format!("{function} \"{n}\""),
                    None => function.to_string(),
                };
                let parent_frame = self.nodes[self.current.0].frame.clone();
                let frame = Arc::new(ContextFrame {
                    label: display_name.clone(),
                    file,
                    line,
                    function,
                    parent: Some(parent_frame),
                });
                let next_sibling = self.nodes[self.current.0].first_child;
                let id = NodeId(self.nodes.len());
                self.nodes.push(Node {
                    token: Some(token),
                    parent: Some(self.current),
                    first_child: None,
                    next_sibling,
                    display_name,
                    file,
                    line,
                    function,
                    frame,
                    active_depth: 0,
                    totals: NodeTotals::default(),
                });
                self.nodes[self.current.0].first_child = Some(id);
                id
            }
        };

        let node = &mut self.nodes[id.0];
        node.active_depth += 1;
        if node.active_depth == 1 {
            node.totals.calls += 1;
        } else {
            node.totals.nested_calls += 1;
        }
        self.current = id;
        id
    }

    /// Close the current scope: decrement its reentrancy depth and move
    /// `current` back to its parent.
    ///
    /// # Panics
    ///
    /// Panics when called with `current` at the root (unbalanced exit) or on
    /// a node whose depth is already zero - both are caller contract bugs.
    pub fn exit(&mut self) {
        assert!(
            self.current != self.root,
            "scope exit without a matching enter (current is the root)"
        );
        let node = &mut self.nodes[self.current.0];
        assert!(
            node.active_depth > 0,
            "scope '{}' exited more times than it was entered",
            node.display_name
        );
        node.active_depth -= 1;
        self.current = node
            .parent
            .expect("non-root nodes always have a parent");
    }

    pub fn find_child(&self, parent: NodeId, token: CallSiteToken) -> Option<NodeId> {
        let mut child = self.nodes[parent.0].first_child;
        while let Some(id) = child {
            if self.nodes[id.0].token == Some(token) {
                return Some(id);
            }
            child = self.nodes[id.0].next_sibling;
        }
        None
    }

    /// Children of `id`, head of the sibling list first.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut child = self.nodes[id.0].first_child;
        while let Some(c) = child {
            out.push(c);
            child = self.nodes[c.0].next_sibling;
        }
        out
    }

    /// Remove `child` from `parent`'s sibling list. The node stays in the
    /// arena but becomes unreachable from the root.
    pub(crate) fn unlink_child(&mut self, parent: NodeId, child: NodeId) {
        if self.nodes[parent.0].first_child == Some(child) {
            self.nodes[parent.0].first_child = self.nodes[child.0].next_sibling;
        } else {
            let mut cur = self.nodes[parent.0].first_child;
            while let Some(c) = cur {
                if self.nodes[c.0].next_sibling == Some(child) {
                    self.nodes[c.0].next_sibling = self.nodes[child.0].next_sibling;
                    break;
                }
                cur = self.nodes[c.0].next_sibling;
            }
        }
        self.nodes[child.0].parent = None;
        self.nodes[child.0].next_sibling = None;
    }

    /// Append a copy of another tree's node under `parent`, with zeroed
    /// counters and no children. Used by the cross-arena merge.
    pub(crate) fn adopt(&mut self, parent: NodeId, source: &Node) -> NodeId {
        let next_sibling = self.nodes[parent.0].first_child;
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            token: source.token,
            parent: Some(parent),
            first_child: None,
            next_sibling,
            display_name: source.display_name.clone(),
            file: source.file,
            line: source.line,
            function: source.function,
            frame: source.frame.clone(),
            active_depth: 0,
            totals: NodeTotals::default(),
        });
        self.nodes[parent.0].first_child = Some(id);
        id
    }

    /// Depth-first lookup by display name among reachable nodes.
    pub fn find_by_display_name(&self, name: &str) -> Option<NodeId> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if self.nodes[id.0].display_name == name {
                return Some(id);
            }
            stack.extend(self.children(id));
        }
        None
    }

    /// How many reachable nodes carry `token`. After recursion collapse this
    /// is at most one along any root-to-leaf path.
    pub fn count_token(&self, token: CallSiteToken) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if self.nodes[id.0].token == Some(token) {
                count += 1;
            }
            stack.extend(self.children(id));
        }
        count
    }

    /// Reachable node count, root included.
    pub fn reachable_nodes(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            count += 1;
            stack.extend(self.children(id));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> CallTree {
        CallTree::new("Application")
    }

    #[test]
    fn test_enter_creates_child_and_descends() {
        let mut t = tree();
        let token = CallSiteToken::unique();
        let id = t.enter(token, "a.rs", 1, "app::work", None);
        assert_eq!(t.current(), id);
        assert_eq!(t.node(id).display_name, "app::work");
        assert_eq!(t.node(id).totals.calls, 1);
        assert_eq!(t.node(id).parent(), Some(t.root()));
    }

    #[test]
    fn test_reenter_reuses_node() {
        let mut t = tree();
        let token = CallSiteToken::unique();
        let first = t.enter(token, "a.rs", 1, "app::work", None);
        t.exit();
        let second = t.enter(token, "a.rs", 1, "app::work", None);
        t.exit();
        assert_eq!(first, second);
        assert_eq!(t.node(first).totals.calls, 2);
        assert_eq!(t.node(first).totals.nested_calls, 0);
    }

    #[test]
    fn test_recursive_entry_builds_a_chain() {
        // Recursion is represented as a chain of distinct nodes sharing one
        // token until the collapse step folds them together.
        let mut t = tree();
        let token = CallSiteToken::unique();
        let a = t.enter(token, "a.rs", 1, "app::recurse", None);
        let b = t.enter(token, "a.rs", 1, "app::recurse", None);
        let c = t.enter(token, "a.rs", 1, "app::recurse", None);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(t.node(b).parent(), Some(a));
        assert_eq!(t.node(c).parent(), Some(b));
        t.exit();
        t.exit();
        t.exit();
        assert_eq!(t.current(), t.root());
        assert_eq!(t.count_token(token), 3);
        for id in [a, b, c] {
            assert_eq!(t.node(id).totals.calls, 1);
            assert_eq!(t.node(id).active_depth, 0);
        }
    }

    #[test]
    fn test_depth_returns_to_zero_on_balanced_sequence() {
        let mut t = tree();
        let a = CallSiteToken::unique();
        let b = CallSiteToken::unique();
        let id_a = t.enter(a, "a.rs", 1, "fn_a", None);
        let id_b = t.enter(b, "a.rs", 2, "fn_b", None);
        t.exit();
        t.exit();
        assert_eq!(t.node(id_a).active_depth, 0);
        assert_eq!(t.node(id_b).active_depth, 0);
        assert_eq!(t.current(), t.root());
    }

    #[test]
    fn test_named_scope_display_name() {
        let mut t = tree();
        let id = t.enter(CallSiteToken::unique(), "a.rs", 9, "app::stage", Some("parse"));
        assert_eq!(t.node(id).display_name, "app::stage \"parse\"");
    }

    #[test]
    fn test_new_child_becomes_sibling_head() {
        let mut t = tree();
        let a = CallSiteToken::unique();
        let b = CallSiteToken::unique();
        let id_a = t.enter(a, "a.rs", 1, "fn_a", None);
        t.exit();
        let id_b = t.enter(b, "a.rs", 2, "fn_b", None);
        t.exit();
        assert_eq!(t.children(t.root()), vec![id_b, id_a]);
    }

    #[test]
    #[should_panic(expected = "scope exit without a matching enter")]
    fn test_exit_at_root_panics() {
        let mut t = tree();
        t.exit();
    }

    #[test]
    fn test_unlink_child_middle_of_list() {
        let mut t = tree();
        let tokens: Vec<_> = (0..3).map(|_| CallSiteToken::unique()).collect();
        let ids: Vec<_> = tokens
            .iter()
            .map(|&tok| {
                let id = t.enter(tok, "a.rs", 1, "child", None);
                t.exit();
                id
            })
            .collect();
        t.unlink_child(t.root(), ids[1]);
        assert_eq!(t.children(t.root()), vec![ids[2], ids[0]]);
    }
}
