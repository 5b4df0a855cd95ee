use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Counters for the coordination and convergence paths
#[derive(Debug, Default)]
pub struct ConvergenceMetrics {
    pub lock_acquisitions: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub group_runs: AtomicU64,
    pub run_failures: AtomicU64,
    pub steps_executed: AtomicU64,
    pub dirty_marks: AtomicU64,
    pub dirty_mark_failures: AtomicU64,
}

impl ConvergenceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lock_acquisition(&self) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
        warn!("Convergence lock acquisition timed out");
    }

    pub fn record_group_run(&self) {
        self.group_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_failure(&self) {
        self.run_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_steps_executed(&self, count: usize) {
        self.steps_executed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_dirty_mark(&self, succeeded: bool) {
        if succeeded {
            self.dirty_marks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dirty_mark_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_stats(&self) -> ConvergenceStats {
        ConvergenceStats {
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            group_runs: self.group_runs.load(Ordering::Relaxed),
            run_failures: self.run_failures.load(Ordering::Relaxed),
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            dirty_marks: self.dirty_marks.load(Ordering::Relaxed),
            dirty_mark_failures: self.dirty_mark_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Convergence metrics: locks={}, lock_timeouts={}, runs={}, run_failures={}, steps={}, dirty_marks={}, dirty_mark_failures={}",
            stats.lock_acquisitions,
            stats.lock_timeouts,
            stats.group_runs,
            stats.run_failures,
            stats.steps_executed,
            stats.dirty_marks,
            stats.dirty_mark_failures
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceStats {
    pub lock_acquisitions: u64,
    pub lock_timeouts: u64,
    pub group_runs: u64,
    pub run_failures: u64,
    pub steps_executed: u64,
    pub dirty_marks: u64,
    pub dirty_mark_failures: u64,
}

/// Global metrics instance
static CONVERGENCE_METRICS: std::sync::LazyLock<ConvergenceMetrics> =
    std::sync::LazyLock::new(ConvergenceMetrics::new);

pub fn convergence_metrics() -> &'static ConvergenceMetrics {
    &CONVERGENCE_METRICS
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
