//! Report renderer for the master call tree
//!
//! Sorts each sibling list by descending inclusive runtime, crops node names
//! against their parents so deeply nested qualified paths stay readable, and
//! renders the tree as an indented text table with dot leaders.
//!
//! Name cropping markers:
//! - `**` replaces a child name that starts with the parent's full name;
//! - `*:` replaces a qualifier prefix (up to the parent's last `::`) the
//!   child shares with the parent.

use crate::tree::{CallTree, NodeId, NodeTotals};
use std::io::{self, Write};

/// One report column. The set is closed and known at design time; rendering
/// dispatches through [`header`](Column::header) and
/// [`format_value`](Column::format_value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// Inclusive milliseconds and completed call count.
    RuntimeAndCalls,
    /// Nested (recursive/reentrant) call count.
    NestedCalls,
    /// Bytes allocated, unit-scaled.
    BytesAllocated,
    /// Bytes freed, unit-scaled.
    BytesFreed,
}

impl Column {
    pub fn header(self) -> &'static str {
        match self {
            Column::RuntimeAndCalls => "|Total ms|   Calls",
            Column::NestedCalls => "|  Nested",
            Column::BytesAllocated => "|Allocated",
            Column::BytesFreed => "|    Freed",
        }
    }

    pub fn format_value(self, totals: &NodeTotals) -> String {
        match self {
            Column::RuntimeAndCalls => {
                format!("|{:>8}|{:>8}", totals.runtime_ms, totals.calls)
            }
            Column::NestedCalls => format!("|{:>8}", totals.nested_calls),
            Column::BytesAllocated => format!("|{}", format_bytes(totals.bytes_allocated)),
            Column::BytesFreed => format!("|{}", format_bytes(totals.bytes_freed)),
        }
    }
}

/// The column set for a report, depending on whether allocation tracking is
/// enabled.
pub fn columns(track_allocations: bool) -> Vec<Column> {
    let mut cols = vec![Column::RuntimeAndCalls, Column::NestedCalls];
    if track_allocations {
        cols.push(Column::BytesAllocated);
        cols.push(Column::BytesFreed);
    }
    cols
}

/// Scale a byte count to b/kb/mb/gb, nine characters wide.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1000 {
        format!("{bytes:>7} b")
    } else if (bytes >> 10) < 1000 {
        format!("{:>7.3}kb", bytes as f64 / 1024.0)
    } else if (bytes >> 20) < 1000 {
        format!("{:>7.3}mb", bytes as f64 / 1_048_576.0)
    } else {
        format!("{:>7.3}gb", bytes as f64 / (1_048_576.0 * 1024.0))
    }
}

/// Crop `child`'s display name against `parent`'s.
fn crop_name(tree: &mut CallTree, parent: NodeId, child: NodeId) {
    let parent_name = tree.node(parent).display_name.clone();
    if parent_name.is_empty() {
        return;
    }
    let name = &tree.node(child).display_name;
    let cropped = if name.starts_with(&parent_name) {
        format!("**{}", &name[parent_name.len()..])
    } else if let Some(idx) = parent_name.rfind("::") {
        // Shared qualifier prefix, up to and including the first colon of
        // the parent's last `::` separator.
        let prefix = &parent_name[..idx + 1];
        if name.starts_with(prefix) {
            format!("*:{}", &name[prefix.len()..])
        } else {
            return;
        }
    } else {
        return;
    };
    tree.node_mut(child).display_name = cropped;
}

/// Sort every sibling list by descending inclusive runtime and crop names.
/// Children are processed before their parent's own crop, so cropping always
/// compares uncropped child names against uncropped parent names one level
/// up. Returns the widest indented name, for column alignment.
pub fn sort_and_crop(tree: &mut CallTree) -> usize {
    let root = tree.root();
    let width = sort_children(tree, root, 0);
    width.max(tree.node(root).display_name.len())
}

fn sort_children(tree: &mut CallTree, id: NodeId, depth: usize) -> usize {
    let mut kids = tree.children(id);
    let mut width = 0;
    for &kid in &kids {
        width = width.max(sort_children(tree, kid, depth + 1));
    }
    for &kid in &kids {
        crop_name(tree, id, kid);
        width = width.max(tree.node(kid).display_name.len() + 2 * (depth + 1));
    }
    kids.sort_unstable_by_key(|&kid| std::cmp::Reverse(tree.node(kid).totals.runtime_ms));

    let mut next = None;
    for &kid in kids.iter().rev() {
        tree.node_mut(kid).next_sibling = next;
        next = Some(kid);
    }
    tree.node_mut(id).first_child = next;
    width
}

/// Render the report table. Sorting and cropping mutate the tree's sibling
/// order and display names; counters are untouched.
pub fn render<W: Write>(tree: &mut CallTree, cols: &[Column], w: &mut W) -> io::Result<()> {
    let name_width = sort_and_crop(tree);

    let pad = name_width.saturating_sub("Function".len());
    write!(w, "{:pad$}Function", "")?;
    for col in cols {
        write!(w, "{}", col.header())?;
    }
    writeln!(w)?;

    render_group(tree, tree.root(), 0, name_width, cols, w)
}

fn render_group<W: Write>(
    tree: &CallTree,
    first: NodeId,
    depth: usize,
    name_width: usize,
    cols: &[Column],
    w: &mut W,
) -> io::Result<()> {
    let mut record = Some(first);
    while let Some(id) = record {
        let node = tree.node(id);
        for _ in 0..depth.saturating_sub(1) {
            write!(w, "  ")?;
        }
        if depth > 0 {
            if node.first_child().is_some() {
                write!(w, "+ ")?;
            } else {
                write!(w, "| ")?;
            }
        }
        write!(w, "{}", node.display_name)?;

        // Dot leaders out to the column area.
        let mut spaces = name_width.saturating_sub(node.display_name.len() + depth * 2);
        while spaces > 1 {
            if spaces % 2 == 0 {
                write!(w, " .")?;
            } else {
                write!(w, ". ")?;
            }
            spaces -= 2;
        }
        if spaces > 0 {
            write!(w, ".")?;
        }

        for col in cols {
            write!(w, "{}", col.format_value(&node.totals))?;
        }
        writeln!(w)?;

        if let Some(child) = node.first_child() {
            render_group(tree, child, depth + 1, name_width, cols, w)?;
        }
        record = node.next_sibling();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_site::CallSiteToken;

    fn add_child(tree: &mut CallTree, function: &'static str, runtime: u64) -> NodeId {
        let id = tree.enter(CallSiteToken::unique(), "r.rs", 1, function, None);
        tree.node_mut(id).totals.runtime_ms = runtime;
        tree.exit();
        id
    }

    #[test]
    fn test_full_prefix_cropped_with_stars() {
        let mut tree = CallTree::new("Application");
        let parent = tree.enter(CallSiteToken::unique(), "r.rs", 1, "app::stage", None);
        let child = tree.enter(CallSiteToken::unique(), "r.rs", 2, "app::stage::inner", None);
        tree.exit();
        tree.exit();
        crop_name(&mut tree, parent, child);
        assert_eq!(tree.node(child).display_name, "**::inner");
    }

    #[test]
    fn test_namespace_prefix_cropped_with_star_colon() {
        let mut tree = CallTree::new("Application");
        let parent = tree.enter(CallSiteToken::unique(), "r.rs", 1, "app::db::query", None);
        let child = tree.enter(CallSiteToken::unique(), "r.rs", 2, "app::db::commit", None);
        tree.exit();
        tree.exit();
        crop_name(&mut tree, parent, child);
        assert_eq!(tree.node(child).display_name, "*::commit");
    }

    #[test]
    fn test_unrelated_names_left_alone() {
        let mut tree = CallTree::new("Application");
        let parent = tree.enter(CallSiteToken::unique(), "r.rs", 1, "alpha::work", None);
        let child = tree.enter(CallSiteToken::unique(), "r.rs", 2, "beta::other", None);
        tree.exit();
        tree.exit();
        crop_name(&mut tree, parent, child);
        assert_eq!(tree.node(child).display_name, "beta::other");
    }

    #[test]
    fn test_sort_orders_siblings_by_descending_runtime() {
        let mut tree = CallTree::new("Application");
        let slow = add_child(&mut tree, "slow", 100);
        let fast = add_child(&mut tree, "fast", 1);
        let medium = add_child(&mut tree, "medium", 50);
        sort_and_crop(&mut tree);
        assert_eq!(tree.children(tree.root()), vec![slow, medium, fast]);
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(64), "     64 b");
        assert_eq!(format_bytes(999), "    999 b");
        assert!(format_bytes(2048).ends_with("kb"));
        assert!(format_bytes(3 * 1024 * 1024).ends_with("mb"));
        assert!(format_bytes(5 * 1024 * 1024 * 1024).ends_with("gb"));
    }

    #[test]
    fn test_render_contains_header_and_rows() {
        let mut tree = CallTree::new("Application");
        add_child(&mut tree, "busy_loop", 42);
        let mut buf = Vec::new();
        render(&mut tree, &columns(true), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("Function|Total ms|   Calls|  Nested|Allocated|    Freed"));
        assert!(text.contains("Application"));
        assert!(text.contains("busy_loop"));
        assert!(text.contains("42"));
    }

    #[test]
    fn test_render_without_allocation_columns() {
        let mut tree = CallTree::new("Application");
        add_child(&mut tree, "busy_loop", 1);
        let mut buf = Vec::new();
        render(&mut tree, &columns(false), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("Allocated"));
        assert!(text.contains("Nested"));
    }
}
