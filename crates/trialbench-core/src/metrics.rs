//! Process-wide counters for a trialbench run.
//!
//! Incremented at the call site; [`Metrics::flush`] reports them as one
//! `tracing::info!` event when the run ends.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    trials_started: AtomicU64,
    probe_attempts: AtomicU64,
    processes_signalled: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// All counters at zero.
    pub const fn new() -> Self {
        Self {
            trials_started: AtomicU64::new(0),
            probe_attempts: AtomicU64::new(0),
            processes_signalled: AtomicU64::new(0),
        }
    }

    /// One trial started.
    pub fn inc_trials_started(&self) {
        self.trials_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "trials_started", "counter incremented");
    }

    /// One HTTP readiness request, successful or not.
    pub fn inc_probe_attempts(&self) {
        self.probe_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// One signal (or forced kill) delivered to a process.
    pub fn inc_processes_signalled(&self) {
        self.processes_signalled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "processes_signalled", "counter incremented");
    }

    /// Report every counter as one event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            trials_started = self.trials_started(),
            probe_attempts = self.probe_attempts(),
            processes_signalled = self.processes_signalled(),
        );
    }

    /// Trials started so far.
    pub fn trials_started(&self) -> u64 {
        self.trials_started.load(Ordering::Relaxed)
    }

    /// Readiness requests sent so far.
    pub fn probe_attempts(&self) -> u64 {
        self.probe_attempts.load(Ordering::Relaxed)
    }

    /// Signals delivered so far.
    pub fn processes_signalled(&self) -> u64 {
        self.processes_signalled.load(Ordering::Relaxed)
    }
}
