//! Process-wide profiler context
//!
//! One `Profiler` exists per process, explicitly initialized with
//! [`Profiler::init`] or lazily with defaults on the first scope entry. It
//! owns the master tree, the thread registry, the sampling engine, and the
//! startup overhead calibration.
//!
//! Lifecycle: the master tree is created before any per-thread state and
//! outlives all of it. Each terminating thread collapses and cascades its
//! own tree, then folds it into the master under the master's exclusive
//! lock. [`Profiler::shutdown`] stops the sampler, drains whatever threads
//! are still live, and writes the profiling and leak reports.

use crate::config::ProfilerConfig;
use crate::lock;
use crate::memory;
use crate::merge::{cascade_timings, collapse_recursion, merge_tree, OverheadEstimate};
use crate::registry::{ThreadRegistry, ThreadState};
use crate::report;
use crate::sampler::Sampler;
use crate::tree::CallTree;
use crate::call_site::CallSiteToken;
use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem;
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Instant;
use tracing::{debug, info, warn};

static GLOBAL: OnceLock<Profiler> = OnceLock::new();

pub struct Profiler {
    config: ProfilerConfig,
    master: Mutex<CallTree>,
    registry: ThreadRegistry,
    sampler: Mutex<Option<Sampler>>,
    overhead: OnceLock<OverheadEstimate>,
    started: Once,
}

impl Profiler {
    /// Install the process-wide profiler with an explicit configuration.
    ///
    /// Must run before the first instrumented scope; once any thread has
    /// touched the profiler the configuration is fixed and this returns the
    /// existing instance instead.
    pub fn init(config: ProfilerConfig) -> &'static Profiler {
        let mut fresh = false;
        let profiler = GLOBAL.get_or_init(|| {
            fresh = true;
            Profiler::new(config)
        });
        if !fresh {
            warn!("profiler already initialized; configuration ignored");
        }
        profiler
    }

    /// The process-wide profiler, created with defaults on first use.
    pub fn global() -> &'static Profiler {
        GLOBAL.get_or_init(|| Profiler::new(ProfilerConfig::default()))
    }

    fn new(config: ProfilerConfig) -> Self {
        Profiler {
            master: Mutex::new(CallTree::new(&config.application_name)),
            registry: ThreadRegistry::new(),
            sampler: Mutex::new(None),
            overhead: OnceLock::new(),
            started: Once::new(),
            config,
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Number of threads currently holding live profiler state.
    pub fn live_threads(&self) -> usize {
        self.registry.len()
    }

    /// Lazily start the sampler and run calibration, once, on the first
    /// thread registration.
    fn ensure_started(&self) {
        self.started.call_once(|| {
            if self.config.overhead_correction {
                let estimate = measure_overhead(self.config.overhead_loops);
                debug!(
                    self_ms = estimate.self_ms_per_call,
                    contained_ms = estimate.contained_ms_per_call,
                    "overhead calibration complete"
                );
                let _ = self.overhead.set(estimate);
            }
            *lock(&self.sampler) = Some(Sampler::start(self.config.sample_interval));
            info!(interval = ?self.config.sample_interval, "profiler started");
        });
    }

    pub(crate) fn on_thread_start(&self) -> Arc<ThreadState> {
        self.ensure_started();
        let state = Arc::new(ThreadState::new(
            std::thread::current().id(),
            &self.config.application_name,
        ));
        self.registry.register(state.clone());
        state
    }

    /// Thread-termination hook: deregister, then collapse, cascade, and
    /// merge the thread's tree into the master.
    pub(crate) fn on_thread_stop(&self, state: &Arc<ThreadState>) {
        self.registry.deregister(state.thread_id());
        let tree = self.take_tree(state);
        self.merge_finished_tree(tree);
    }

    /// Swap the thread's tree for a fresh one, returning the measurements.
    fn take_tree(&self, state: &Arc<ThreadState>) -> CallTree {
        let mut guard = lock(&state.tree);
        mem::replace(&mut *guard, CallTree::new(&self.config.application_name))
    }

    fn merge_finished_tree(&self, mut tree: CallTree) {
        collapse_recursion(&mut tree);
        cascade_timings(&mut tree, self.overhead_estimate());
        let mut master = lock(&self.master);
        merge_tree(&mut master, &tree);
        debug!("thread tree merged into master");
    }

    fn overhead_estimate(&self) -> Option<&OverheadEstimate> {
        if self.config.overhead_correction {
            self.overhead.get()
        } else {
            None
        }
    }

    /// Clone of the master tree as merged so far. Totals are inclusive for
    /// every already-merged thread; threads still running are not included.
    pub fn snapshot(&self) -> CallTree {
        lock(&self.master).clone()
    }

    /// Fold every still-live thread's measurements into the master without
    /// waiting for those threads to terminate. Scopes active at this moment
    /// keep running unmeasured (their guards detect the swapped tree).
    pub fn drain_live_threads(&self) {
        for state in self.registry.live_states() {
            let tree = self.take_tree(&state);
            self.merge_finished_tree(tree);
        }
    }

    /// Stop the sampler, drain live threads, and write the profiling and
    /// leak reports to their configured paths.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(mut sampler) = lock(&self.sampler).take() {
            sampler.stop();
        }
        self.drain_live_threads();

        let mut tree = self.snapshot();
        let cols = report::columns(self.config.track_allocations);
        let file = File::create(&self.config.report_path)?;
        let mut w = BufWriter::new(file);
        report::render(&mut tree, &cols, &mut w)?;
        w.flush()?;
        info!(path = %self.config.report_path.display(), "profiling report written");

        if self.config.track_allocations {
            let file = File::create(&self.config.leak_report_path)?;
            let mut w = BufWriter::new(file);
            memory::global().write_leak_report(&mut w)?;
            w.flush()?;
            info!(path = %self.config.leak_report_path.display(), "leak report written");
        }
        Ok(())
    }

    /// Render the profiling report for the current master state to `w`
    /// instead of the configured file.
    pub fn write_report<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut tree = self.snapshot();
        let cols = report::columns(self.config.track_allocations);
        report::render(&mut tree, &cols, w)?;
        Ok(())
    }
}

/// Measure per-call instrumentation overhead over `loops` empty cycles.
///
/// Self overhead is the cost of one enter/exit pair on an otherwise idle
/// tree; contained overhead is the additional cost a child cycle imposes on
/// an enclosing scope's measurement. Both are wall-clock averages and only
/// as accurate as startup timing noise allows.
fn measure_overhead(loops: u32) -> OverheadEstimate {
    let loops = loops.max(1);
    let scratch = Mutex::new(CallTree::new("calibration"));
    let outer = CallSiteToken::unique();
    let inner = CallSiteToken::unique();

    let start = Instant::now();
    for _ in 0..loops {
        let mut tree = lock(&scratch);
        tree.enter(inner, file!(), line!(), "calibration", None);
        tree.exit();
    }
    let self_ms_per_call = start.elapsed().as_secs_f64() * 1e3 / f64::from(loops);

    let start = Instant::now();
    {
        let mut tree = lock(&scratch);
        tree.enter(outer, file!(), line!(), "calibration", None);
    }
    for _ in 0..loops {
        let mut tree = lock(&scratch);
        tree.enter(inner, file!(), line!(), "calibration", None);
        tree.exit();
    }
    {
        let mut tree = lock(&scratch);
        tree.exit();
    }
    let contained_cycle_ms = start.elapsed().as_secs_f64() * 1e3 / f64::from(loops);
    let contained_ms_per_call = (contained_cycle_ms - self_ms_per_call).max(0.0);

    OverheadEstimate {
        self_ms_per_call,
        contained_ms_per_call,
    }
}
