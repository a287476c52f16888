use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

use crate::resources::JobResources;

pub const SCHEDULE_FAILURES: &str = "strata.controller.schedule.failures";
pub const COMPLETED_JOBS: &str = "strata.controller.jobs.completed";
pub const FAILED_JOBS: &str = "strata.controller.jobs.failed";
pub const ABORTED_JOBS: &str = "strata.controller.jobs.aborted";
pub const SNAPSHOTS_STARTED: &str = "strata.controller.snapshots.started";
pub const SNAPSHOTS_COMPLETED: &str = "strata.controller.snapshots.completed";
pub const SNAPSHOTS_FAILED: &str = "strata.controller.snapshots.failed";

/// The attribute carrying a schedule failure reason or a job abort reason.
pub const REASON: &str = "strata.reason";

pub fn reason(status: &'static str) -> KeyValue {
    KeyValue::new(REASON, status)
}

/// The controller instruments, created from a meter owned by the embedder.
pub struct ControllerMetrics {
    pub schedule_failures: Counter<u64>,
    pub completed_jobs: Counter<u64>,
    pub failed_jobs: Counter<u64>,
    pub aborted_jobs: Counter<u64>,
    pub snapshots_started: Counter<u64>,
    pub snapshots_completed: Counter<u64>,
    pub snapshots_failed: Counter<u64>,
}

impl ControllerMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            schedule_failures: meter
                .u64_counter(SCHEDULE_FAILURES)
                .with_description("The number of rejected scheduling attempts by reason.")
                .build(),
            completed_jobs: meter
                .u64_counter(COMPLETED_JOBS)
                .with_description("The number of completed jobs.")
                .build(),
            failed_jobs: meter
                .u64_counter(FAILED_JOBS)
                .with_description("The number of failed jobs.")
                .build(),
            aborted_jobs: meter
                .u64_counter(ABORTED_JOBS)
                .with_description("The number of aborted jobs by reason.")
                .build(),
            snapshots_started: meter
                .u64_counter(SNAPSHOTS_STARTED)
                .with_description("The number of snapshots started.")
                .build(),
            snapshots_completed: meter
                .u64_counter(SNAPSHOTS_COMPLETED)
                .with_description("The number of snapshots durably stored.")
                .build(),
            snapshots_failed: meter
                .u64_counter(SNAPSHOTS_FAILED)
                .with_description("The number of snapshots that could not be built or stored.")
                .build(),
        }
    }
}

impl fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerMetrics").finish()
    }
}

/// Aggregate job counters readable from any thread without touching the
/// controller state.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pending: AtomicUsize,
    total: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    aborted: AtomicUsize,
    lost: AtomicUsize,
    needed_cpu_millis: AtomicU64,
    needed_memory: AtomicU64,
}

/// A copy of the progress counters at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationProgress {
    pub pending: usize,
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub lost: usize,
    pub needed_resources: JobResources,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, progress: &OperationProgress) {
        self.pending.store(progress.pending, Ordering::Relaxed);
        self.total.store(progress.total, Ordering::Relaxed);
        self.running.store(progress.running, Ordering::Relaxed);
        self.completed.store(progress.completed, Ordering::Relaxed);
        self.failed.store(progress.failed, Ordering::Relaxed);
        self.aborted.store(progress.aborted, Ordering::Relaxed);
        self.lost.store(progress.lost, Ordering::Relaxed);
        self.needed_cpu_millis.store(
            (progress.needed_resources.cpu * 1000.0).round() as u64,
            Ordering::Relaxed,
        );
        self.needed_memory
            .store(progress.needed_resources.memory, Ordering::Relaxed);
    }

    pub fn load(&self) -> OperationProgress {
        OperationProgress {
            pending: self.pending.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            needed_resources: JobResources {
                cpu: self.needed_cpu_millis.load(Ordering::Relaxed) as f64 / 1000.0,
                memory: self.needed_memory.load(Ordering::Relaxed),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "tests use unwrap for brevity")]
mod tests {
    use strata_telemetry::testing::MetricTester;

    use super::*;

    #[test]
    fn test_reason_attribute() {
        let tester = MetricTester::new();
        let metrics = ControllerMetrics::new(tester.meter());
        metrics.completed_jobs.add(1, &[]);
        metrics.completed_jobs.add(2, &[]);
        metrics
            .schedule_failures
            .add(1, &[reason("NODE_BANNED")]);
        metrics
            .schedule_failures
            .add(4, &[reason("NOT_ENOUGH_RESOURCES")]);

        assert_eq!(tester.counter(COMPLETED_JOBS, &[]).unwrap(), 3);
        assert_eq!(tester.counter(FAILED_JOBS, &[]).unwrap(), 0);
        assert_eq!(
            tester
                .counter(SCHEDULE_FAILURES, &[reason("NODE_BANNED")])
                .unwrap(),
            1
        );
        assert_eq!(tester.counter(SCHEDULE_FAILURES, &[]).unwrap(), 5);
    }

    #[test]
    fn test_progress_counters() {
        let counters = ProgressCounters::new();
        let progress = OperationProgress {
            pending: 2,
            total: 5,
            running: 1,
            completed: 2,
            needed_resources: JobResources {
                cpu: 1.5,
                memory: 300,
                ..Default::default()
            },
            ..Default::default()
        };
        counters.update(&progress);
        assert_eq!(counters.load(), progress);
    }
}
