//! Call-context fingerprints for diagnostics
//!
//! A `ContextFrame` is an owned snapshot of one position in the call tree:
//! its display label, source location, and a reference-counted link to the
//! parent frame. Frames are created alongside tree nodes and handed out as
//! [`ContextToken`]s, so an allocation record (or any other diagnostic) can
//! render the call context that produced it even after the owning thread's
//! tree has been merged away.

use std::io::{self, Write};
use std::sync::Arc;

/// Reference-counted handle to a call-context frame.
pub type ContextToken = Arc<ContextFrame>;

/// One frame of a captured call context.
#[derive(Debug)]
pub struct ContextFrame {
    /// Display label; for the root frame this is the application name.
    pub label: String,
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
    /// Enclosing context, `None` for the root frame.
    pub parent: Option<ContextToken>,
}

/// Render the ancestor chain of `frame` root-first, one frame per line pair.
///
/// The root frame (line 0) prints only its label; instrumented frames print
/// `file(line)` followed by the indented function path.
pub fn write_context_trace<W: Write>(w: &mut W, frame: &ContextFrame) -> io::Result<()> {
    if let Some(parent) = &frame.parent {
        write_context_trace(w, parent)?;
    }
    if frame.line > 0 {
        writeln!(w, "{}({})\n  {}", frame.file, frame.line, frame.function)
    } else {
        writeln!(w, "{}", frame.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ContextToken {
        let root = Arc::new(ContextFrame {
            label: "Application".to_string(),
            file: "",
            line: 0,
            function: "",
            parent: None,
        });
        let outer = Arc::new(ContextFrame {
            label: "app::outer".to_string(),
            file: "src/outer.rs",
            line: 10,
            function: "app::outer",
            parent: Some(root),
        });
        Arc::new(ContextFrame {
            label: "app::inner".to_string(),
            file: "src/inner.rs",
            line: 42,
            function: "app::inner",
            parent: Some(outer),
        })
    }

    #[test]
    fn test_trace_renders_root_first() {
        let mut buf = Vec::new();
        write_context_trace(&mut buf, &chain()).unwrap();
        let text = String::from_utf8(buf).unwrap();

        let root_at = text.find("Application").unwrap();
        let outer_at = text.find("src/outer.rs(10)").unwrap();
        let inner_at = text.find("src/inner.rs(42)").unwrap();
        assert!(root_at < outer_at && outer_at < inner_at);
        assert!(text.contains("  app::inner"));
    }
}
