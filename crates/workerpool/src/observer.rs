//! Pluggable metrics sink.
//!
//! A [`PoolObserver`] is handed to the pool at construction and receives
//! lifecycle callbacks from every dispatcher and worker it owns. All methods
//! default to no-ops so implementors only override what they record.
//! Callbacks run inline on worker and dispatcher tasks and must not block.

use crate::error::JobError;
use core::time::Duration;
use portable_atomic::{AtomicU64, Ordering};

pub trait PoolObserver: Send + Sync + 'static {
    /// A job was claimed from the queue by `dispatcher`.
    fn job_dispatched(&self, _dispatcher: usize) {}

    /// A job's handler returned `Ok`.
    fn job_completed(&self, _dispatcher: usize, _worker: usize, _elapsed: Duration) {}

    /// A job's handler returned an error or panicked.
    fn job_failed(&self, _error: &JobError) {}

    fn worker_stopped(&self, _dispatcher: usize, _worker: usize) {}

    fn dispatcher_stopped(&self, _dispatcher: usize) {}
}

/// Observer that records nothing. Used when none is supplied.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl PoolObserver for NoopObserver {}

/// Lock-free counters for a pool's lifetime.
#[derive(Debug, Default)]
pub struct PoolStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    busy_micros: AtomicU64,
    workers_stopped: AtomicU64,
    dispatchers_stopped: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    /// Total handler wall time of completed jobs.
    pub busy: Duration,
    pub workers_stopped: u64,
    pub dispatchers_stopped: u64,
}

impl StatsSnapshot {
    /// Jobs that have been handled, successfully or not.
    pub const fn handled(&self) -> u64 {
        self.completed + self.failed
    }
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            busy: Duration::from_micros(self.busy_micros.load(Ordering::Relaxed)),
            workers_stopped: self.workers_stopped.load(Ordering::Relaxed),
            dispatchers_stopped: self.dispatchers_stopped.load(Ordering::Relaxed),
        }
    }
}

impl PoolObserver for PoolStats {
    fn job_dispatched(&self, _dispatcher: usize) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn job_completed(&self, _dispatcher: usize, _worker: usize, elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.busy_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn job_failed(&self, _error: &JobError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_stopped(&self, _dispatcher: usize, _worker: usize) {
        self.workers_stopped.fetch_add(1, Ordering::Relaxed);
    }

    fn dispatcher_stopped(&self, _dispatcher: usize) {
        self.dispatchers_stopped.fetch_add(1, Ordering::Relaxed);
    }
}
