//! Background sampler of the process resident set size.
//!
//! The sampler never aborts the work it watches. Crossing the ceiling only
//! sets a flag that ends up in the run's outcome.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fraction of the ceiling at which a single warning is logged.
pub const WARN_RATIO: f64 = 0.8;

/// Reads the current process RSS through sysinfo.
pub struct RssProbe {
    system: System,
    pid: Option<Pid>,
}

impl RssProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Process memory sampling unavailable: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Current RSS in bytes, 0 when the platform cannot report it.
    pub fn sample(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

impl Default for RssProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// What a finished watch observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySummary {
    pub peak_bytes: u64,
    pub ceiling_exceeded: bool,
}

#[derive(Default)]
struct WatchState {
    peak: AtomicU64,
    warned: AtomicBool,
    exceeded: AtomicBool,
}

impl WatchState {
    fn observe(&self, rss: u64, ceiling_bytes: u64, label: &str) {
        self.peak.fetch_max(rss, Ordering::Relaxed);
        if ceiling_bytes == 0 {
            return;
        }
        if rss as f64 >= ceiling_bytes as f64 * WARN_RATIO
            && !self.warned.swap(true, Ordering::Relaxed)
        {
            log::warn!(
                "Memory usage for {} at {} MiB, {:.0}% of the {} MiB ceiling",
                label,
                rss / 1024 / 1024,
                rss as f64 * 100.0 / ceiling_bytes as f64,
                ceiling_bytes / 1024 / 1024
            );
        }
        if rss > ceiling_bytes && !self.exceeded.swap(true, Ordering::Relaxed) {
            log::error!(
                "Memory ceiling of {} MiB exceeded while processing {}",
                ceiling_bytes / 1024 / 1024,
                label
            );
        }
    }
}

/// A running sampler. Call [`MemoryWatch::finish`] to stop it.
pub struct MemoryWatch {
    state: Arc<WatchState>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl MemoryWatch {
    /// Samples once immediately, then every `interval` until finished or
    /// until `parent` is cancelled.
    pub fn start(
        label: impl Into<String>,
        ceiling_bytes: u64,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let label = label.into();
        let state = Arc::new(WatchState::default());
        let stop = parent.child_token();

        let mut probe = RssProbe::new();
        state.observe(probe.sample(), ceiling_bytes, &label);

        let task_state = Arc::clone(&state);
        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = timer.tick() => {
                        task_state.observe(probe.sample(), ceiling_bytes, &label);
                    }
                }
            }
        });

        Self {
            state,
            stop,
            handle,
        }
    }

    pub fn peak_bytes(&self) -> u64 {
        self.state.peak.load(Ordering::Relaxed)
    }

    pub async fn finish(self) -> MemorySummary {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            log::debug!("Memory sampler task ended abnormally: {}", e);
        }
        MemorySummary {
            peak_bytes: self.state.peak.load(Ordering::Relaxed),
            ceiling_exceeded: self.state.exceeded.load(Ordering::Relaxed),
        }
    }
}
