//! Background progress monitor for long build/validation runs.
//!
//! Shared atomic counters are incremented by build and validation workers;
//! a background task periodically logs one summary line so operators can
//! track runs without parsing individual build logs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::info;

/// Shared counters, cloned into build/validation workers.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    pub envs_built: Arc<AtomicUsize>,
    pub envs_failed: Arc<AtomicUsize>,
    pub instances_built: Arc<AtomicUsize>,
    pub instances_failed: Arc<AtomicUsize>,
    pub validations_passed: Arc<AtomicUsize>,
    pub validations_failed: Arc<AtomicUsize>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> (usize, usize, usize, usize, usize, usize) {
        (
            self.envs_built.load(Ordering::Relaxed),
            self.envs_failed.load(Ordering::Relaxed),
            self.instances_built.load(Ordering::Relaxed),
            self.instances_failed.load(Ordering::Relaxed),
            self.validations_passed.load(Ordering::Relaxed),
            self.validations_failed.load(Ordering::Relaxed),
        )
    }
}

/// Periodic logger over a [`ProgressCounters`].
pub struct ProgressMonitor {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ProgressMonitor {
    /// Start logging a summary line every `interval`.
    pub fn start(counters: ProgressCounters, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let started = Instant::now();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                let (eb, ef, ib, inf, vp, vf) = counters.snapshot();
                info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    envs_built = eb,
                    envs_failed = ef,
                    instances_built = ib,
                    instances_failed = inf,
                    validations_passed = vp,
                    validations_failed = vf,
                    "pipeline progress"
                );
            }
        });

        Self { stop, handle }
    }

    /// Stop the monitor and wait for the task to exit.
    pub async fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
        let _ = self.handle.await;
    }
}
