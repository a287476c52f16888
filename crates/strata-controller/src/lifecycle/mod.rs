mod core;
mod event_log;
mod joblet;
mod options;
mod splitter;
mod state;
mod summary;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
pub use event_log::{JobEvent, JobEventLog};
pub use joblet::{AbortReason, InterruptReason, JobState, Joblet};
pub use options::LifecycleOptions;
pub use splitter::{DurationJobSplitter, JobSplitter, SplitDecision};
pub use state::{JobCounters, LifecycleState};
pub use summary::{
    AbortedJobSummary, CompletedJobSummary, FailedJobSummary, OutputChunk, RunningJobSummary,
};

use crate::chunk_tracker::ChunkAvailabilityTracker;
use crate::host::ControllerHost;
use crate::id::{JobId, NodeId};
use crate::metrics::ControllerMetrics;
use crate::scheduler::Scheduler;
use crate::snapshot::SnapshotCoordinator;
use crate::task::TaskTable;

/// Owns the joblets of the operation and drives their state machine.
pub struct JobLifecycleManager {
    options: LifecycleOptions,
    joblets: IndexMap<JobId, Joblet>,
    counters: JobCounters,
    job_node_count: usize,
    stderr_count: usize,
    splitter: Box<dyn JobSplitter>,
    events: JobEventLog,
}

impl JobLifecycleManager {
    pub fn new(options: LifecycleOptions) -> Self {
        let splitter = Box::new(DurationJobSplitter::new(options.job_splitting.clone()));
        Self::with_splitter(options, splitter)
    }

    pub fn with_splitter(options: LifecycleOptions, splitter: Box<dyn JobSplitter>) -> Self {
        Self {
            options,
            joblets: IndexMap::new(),
            counters: JobCounters::default(),
            job_node_count: 0,
            stderr_count: 0,
            splitter,
            events: JobEventLog::default(),
        }
    }
}

/// The controller state touched by job transitions.
pub struct LifecycleContext<'a> {
    pub tasks: &'a mut TaskTable,
    pub scheduler: &'a mut Scheduler,
    pub chunk_tracker: &'a mut ChunkAvailabilityTracker,
    pub snapshots: &'a mut SnapshotCoordinator,
    pub host: &'a dyn ControllerHost,
    pub metrics: &'a ControllerMetrics,
    /// The nodes the controller currently knows about.
    pub known_nodes: &'a HashSet<NodeId>,
    pub now: DateTime<Utc>,
}

/// What the controller should do with the operation after a job transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Continue,
    Suspend(String),
}
