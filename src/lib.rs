//! Centinela - statistical call-tree profiler with guarded allocation tracking
//!
//! Instruments a running program with two fused facilities:
//!
//! - a **call-tree profiler** that builds one private call tree per thread
//!   from RAII scope guards, charges wall time statistically from a 1ms
//!   sampling thread, collapses recursion, and merges every thread's tree
//!   into a process-wide master tree at thread exit;
//! - a **guarded allocation tracker** that wraps raw allocations in
//!   signature-stamped headers and guard words, attributes byte counts to
//!   the current call-tree node, detects buffer overruns and underruns and
//!   mismatched free kinds at release time, and reports leaks at shutdown.
//!
//! Scope entry and exit never read a clock; per-call overhead is a hash
//! lookup and a cursor move. Reported times are statistical and only
//! meaningful in aggregate.
//!
//! # Usage
//!
//! ```no_run
//! use centinela::{profile_scope, Profiler, ProfilerConfig};
//!
//! fn handle_request() {
//!     profile_scope!();
//!     parse_headers();
//! }
//!
//! fn parse_headers() {
//!     profile_scope!("headers");
//!     // work...
//! }
//!
//! Profiler::init(ProfilerConfig::default().with_application_name("server"));
//! handle_request();
//! Profiler::global().shutdown().unwrap();
//! ```
//!
//! The report lands at the configured path as an indented text table, one
//! row per call-tree node, siblings sorted by descending inclusive runtime.

pub mod call_site;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod merge;
pub mod profiler;
pub(crate) mod registry;
pub mod report;
pub(crate) mod sampler;
pub mod scope;
pub mod tree;

pub use call_site::CallSiteToken;
pub use config::ProfilerConfig;
pub use context::ContextToken;
pub use error::{GuardRegion, MemoryError, ProfilerError, Result};
pub use memory::{AllocKind, AllocSite, MemoryTracker};
pub use profiler::Profiler;
pub use scope::ScopeGuard;
pub use tree::{CallTree, Node, NodeId, NodeTotals};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data on poisoning. A panicking instrumented
/// scope must not take the whole profiler down with it; the counters a
/// poisoned guard leaves behind are still internally consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
