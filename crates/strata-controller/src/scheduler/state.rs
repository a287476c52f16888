use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::host::{JobSpec, NodeDescriptor};
use crate::id::{JobId, NodeId};
use crate::lifecycle::Joblet;
use crate::resources::JobResources;
use crate::scheduler::ChunkListPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleFailReason {
    NotEnoughResources,
    NoPendingJobs,
    NodeBanned,
    TaskDelayed,
    NoLocalJobs,
    NoCandidateTasks,
    NotEnoughChunkLists,
    OperationNotRunning,
    JobSpecThrottling,
}

impl ScheduleFailReason {
    pub fn status(&self) -> &'static str {
        match self {
            ScheduleFailReason::NotEnoughResources => "NOT_ENOUGH_RESOURCES",
            ScheduleFailReason::NoPendingJobs => "NO_PENDING_JOBS",
            ScheduleFailReason::NodeBanned => "NODE_BANNED",
            ScheduleFailReason::TaskDelayed => "TASK_DELAYED",
            ScheduleFailReason::NoLocalJobs => "NO_LOCAL_JOBS",
            ScheduleFailReason::NoCandidateTasks => "NO_CANDIDATE_TASKS",
            ScheduleFailReason::NotEnoughChunkLists => "NOT_ENOUGH_CHUNK_LISTS",
            ScheduleFailReason::OperationNotRunning => "OPERATION_NOT_RUNNING",
            ScheduleFailReason::JobSpecThrottling => "JOB_SPEC_THROTTLING",
        }
    }
}

/// The decision to start a job on the offering node.
#[derive(Debug, Clone)]
pub struct JobStartDescriptor {
    pub job_id: JobId,
    pub node: NodeDescriptor,
    pub job_type: String,
    pub resource_limits: JobResources,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleResult {
    pub start: Option<JobStartDescriptor>,
    pub failures: IndexMap<ScheduleFailReason, usize>,
    /// Whether the caller should stop offering resources to the operation for now.
    pub stop_needed: bool,
}

impl ScheduleResult {
    pub fn record_fail(&mut self, reason: ScheduleFailReason) {
        *self.failures.entry(reason).or_default() += 1;
    }

    pub fn failure_count(&self, reason: ScheduleFailReason) -> usize {
        self.failures.get(&reason).copied().unwrap_or(0)
    }

    /// The recorded reasons, most frequent first.
    pub fn ranked_failures(&self) -> Vec<(ScheduleFailReason, usize)> {
        let mut failures = self
            .failures
            .iter()
            .map(|(reason, count)| (*reason, *count))
            .collect::<Vec<_>>();
        failures.sort_by(|a, b| b.1.cmp(&a.1));
        failures
    }
}

/// The result of one scheduling attempt, with the new joblet if a job was started.
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub result: ScheduleResult,
    pub joblet: Option<Joblet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub banned_nodes: IndexSet<NodeId>,
    pub next_job_id: u64,
    pub chunk_lists: ChunkListPool,
}
