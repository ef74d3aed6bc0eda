//! Statistical sampling engine
//!
//! One background thread charges elapsed wall time to whichever node is
//! current on every live thread, on a fixed small interval. This is the
//! system's only timing mechanism: scope entry and exit never read a clock,
//! trading per-call precision for near-zero per-call overhead. A node's
//! reported time is therefore only meaningful in aggregate over many
//! samples; a single fast call may be over- or under-counted.
//!
//! The stop channel doubles as the tick clock: `recv_timeout(interval)`
//! either times out (a tick) or delivers the cooperative stop request.

use crate::profiler::Profiler;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

pub(crate) struct Sampler {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    pub(crate) fn start(interval: Duration) -> Sampler {
        let (stop, ticks) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("centinela-sampler".to_string())
            .spawn(move || {
                debug!(?interval, "sampler started");
                let mut last = Instant::now();
                loop {
                    match ticks.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let now = Instant::now();
                    let elapsed_ms = now.duration_since(last).as_millis() as u64;
                    if elapsed_ms == 0 {
                        continue; // sub-millisecond tick, fold into the next one
                    }
                    last = now;
                    Profiler::global()
                        .registry()
                        .for_each_live(|state| state.charge_sample(elapsed_ms));
                }
                debug!("sampler stopped");
            })
            .expect("failed to spawn sampler thread");
        Sampler {
            stop,
            handle: Some(handle),
        }
    }

    /// Request a cooperative stop and wait for the thread to unwind.
    pub(crate) fn stop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}
