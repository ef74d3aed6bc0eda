//! Process-wide call-site identity
//!
//! Every instrumented source location owns one `CallSite` cell, declared as a
//! hidden `static` by the `call_site!()` macro. The first time the site is
//! executed it draws a token from a process-wide monotonic counter; the token
//! is stable for the rest of the process lifetime and unique per call site.
//! Tokens are compared only for equality - they are identity, not value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one instrumented source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteToken(u64);

impl CallSiteToken {
    /// Draw a fresh token outside of any `static` cell.
    ///
    /// Used by calibration loops and tests that need a call site without a
    /// fixed source location.
    pub fn unique() -> Self {
        CallSiteToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

/// Per-call-site token cell. Const-constructible so it can live in a `static`.
pub struct CallSite {
    id: OnceLock<u64>,
}

impl CallSite {
    pub const fn new() -> Self {
        CallSite { id: OnceLock::new() }
    }

    /// The token for this site, assigned on first use.
    pub fn token(&self) -> CallSiteToken {
        CallSiteToken(*self.id.get_or_init(|| NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)))
    }
}

impl Default for CallSite {
    fn default() -> Self {
        Self::new()
    }
}

/// Expands to the stable [`CallSiteToken`] of the expansion site.
#[macro_export]
macro_rules! call_site {
    () => {{
        static SITE: $crate::call_site::CallSite = $crate::call_site::CallSite::new();
        SITE.token()
    }};
}

/// The path of the enclosing function, e.g. `my_crate::module::function`.
#[macro_export]
macro_rules! function_path {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        name.strip_suffix("::f").unwrap_or(name)
    }};
}
