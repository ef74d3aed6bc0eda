//! Property-based tests for the call tree, the merge pipeline, and the
//! report renderer.

use centinela::merge::{cascade_timings, collapse_recursion, merge_tree};
use centinela::report;
use centinela::{CallSiteToken, CallTree};
use proptest::prelude::*;

/// Apply a walk to the tree: `(true, i)` enters with token `i`, `(false, _)`
/// exits if not already at the root. Returns the number of scopes entered.
fn apply_walk(tree: &mut CallTree, tokens: &[CallSiteToken], walk: &[(bool, usize)]) -> usize {
    let mut depth = 0usize;
    let mut entered = 0usize;
    for &(enter, i) in walk {
        if enter {
            let token = tokens[i % tokens.len()];
            tree.enter(token, "walk.rs", i as u32, "walked::scope", None);
            depth += 1;
            entered += 1;
        } else if depth > 0 {
            tree.exit();
            depth -= 1;
        }
    }
    for _ in 0..depth {
        tree.exit();
    }
    entered
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_any_walk_returns_to_the_root(
        walk in prop::collection::vec((any::<bool>(), 0usize..8), 0..200),
    ) {
        let tokens: Vec<CallSiteToken> = (0..4).map(|_| CallSiteToken::unique()).collect();
        let mut tree = CallTree::new("Application");
        let entered = apply_walk(&mut tree, &tokens, &walk);

        prop_assert_eq!(tree.current(), tree.root());
        // One arena slot per distinct (parent, token) pair, at most one per
        // entry, plus the root.
        prop_assert!(tree.reachable_nodes() <= entered + 1);
    }

    #[test]
    fn prop_collapse_then_cascade_preserves_invocations(
        walk in prop::collection::vec((any::<bool>(), 0usize..4), 0..120),
    ) {
        let tokens: Vec<CallSiteToken> = (0..2).map(|_| CallSiteToken::unique()).collect();
        let mut tree = CallTree::new("Application");
        let entered = apply_walk(&mut tree, &tokens, &walk);

        let total = |tree: &CallTree| {
            let mut sum = 0u64;
            let mut stack = vec![tree.root()];
            while let Some(id) = stack.pop() {
                let node = tree.node(id);
                sum += node.totals.calls + node.totals.nested_calls;
                stack.extend(tree.children(id));
            }
            sum
        };

        prop_assert_eq!(total(&tree), entered as u64);
        collapse_recursion(&mut tree);
        cascade_timings(&mut tree, None);
        prop_assert_eq!(total(&tree), entered as u64);
    }

    #[test]
    fn prop_merge_totals_are_additive(
        walk_a in prop::collection::vec((any::<bool>(), 0usize..4), 0..80),
        walk_b in prop::collection::vec((any::<bool>(), 0usize..4), 0..80),
    ) {
        let tokens: Vec<CallSiteToken> = (0..3).map(|_| CallSiteToken::unique()).collect();
        let mut master = CallTree::new("Application");
        let mut source = CallTree::new("Application");
        let entered_a = apply_walk(&mut master, &tokens, &walk_a);
        let entered_b = apply_walk(&mut source, &tokens, &walk_b);

        merge_tree(&mut master, &source);

        let mut sum = 0u64;
        let mut stack = vec![master.root()];
        while let Some(id) = stack.pop() {
            sum += master.node(id).totals.calls;
            stack.extend(master.children(id));
        }
        prop_assert_eq!(sum, (entered_a + entered_b) as u64);
    }

    #[test]
    fn prop_render_emits_one_row_per_node(
        names in prop::collection::vec("[a-z]{1,6}(::[a-z]{1,6}){0,3}", 1..12),
        walk in prop::collection::vec((any::<bool>(), 0usize..12), 0..60),
    ) {
        let mut tree = CallTree::new("Application");
        let mut depth = 0usize;
        for &(enter, i) in &walk {
            if enter {
                let name: &str = &names[i % names.len()];
                // Leak the name so the tree can hold it as 'static.
                let function: &'static str = Box::leak(name.to_string().into_boxed_str());
                tree.enter(CallSiteToken::unique(), "walk.rs", i as u32, function, None);
                depth += 1;
            } else if depth > 0 {
                tree.exit();
                depth -= 1;
            }
        }
        for _ in 0..depth {
            tree.exit();
        }

        let mut buf = Vec::new();
        report::render(&mut tree, &report::columns(true), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        prop_assert_eq!(text.lines().count(), tree.reachable_nodes() + 1);
    }

    #[test]
    fn prop_format_bytes_always_scaled(bytes in any::<u64>()) {
        let text = report::format_bytes(bytes);
        prop_assert!(text.len() >= 9);
        prop_assert!(
            text.ends_with(" b")
                || text.ends_with("kb")
                || text.ends_with("mb")
                || text.ends_with("gb")
        );
        let number = text[..text.len() - 2].trim();
        prop_assert!(number.parse::<f64>().is_ok());
    }
}
