//! Configuration for the profiler context

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for [`Profiler`](crate::profiler::Profiler).
///
/// The defaults reproduce the classic diagnostic setup: 1 ms sampling,
/// 16 guard words on either side of every tracked allocation, reports written
/// to `profile.txt` and `memleaks.log` in the working directory.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Name of the synthetic root node in reports.
    pub application_name: String,
    /// Sampling engine tick interval.
    pub sample_interval: Duration,
    /// Subtract pre-measured instrumentation overhead during the time cascade.
    ///
    /// The correction is an approximation whose accuracy depends on
    /// measurement noise during startup calibration; it is off by default.
    pub overhead_correction: bool,
    /// Number of empty scope cycles used to calibrate overhead.
    pub overhead_loops: u32,
    /// Guard words on each side of a tracked allocation's payload. Must be >= 1.
    pub guard_words: usize,
    /// Track allocation byte counts and emit the leak report.
    pub track_allocations: bool,
    /// Destination of the profiling report written at shutdown.
    pub report_path: PathBuf,
    /// Destination of the leak report written at shutdown.
    pub leak_report_path: PathBuf,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            application_name: "Application".to_string(),
            sample_interval: Duration::from_millis(1),
            overhead_correction: false,
            overhead_loops: 200_000,
            guard_words: 16,
            track_allocations: true,
            report_path: PathBuf::from("profile.txt"),
            leak_report_path: PathBuf::from("memleaks.log"),
        }
    }
}

impl ProfilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_overhead_correction(mut self, enabled: bool) -> Self {
        self.overhead_correction = enabled;
        self
    }

    pub fn with_guard_words(mut self, words: usize) -> Self {
        assert!(words >= 1, "at least one guard word is required");
        self.guard_words = words;
        self
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = path.into();
        self
    }

    pub fn with_leak_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.leak_report_path = path.into();
        self
    }
}
