use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::NodeDescriptor;
use crate::id::{ChunkId, ChunkListId, JobId, PoolCookie, TaskIndex};
use crate::resources::JobResources;
use crate::statistics::JobStatistics;
use crate::task::{MemoryReserveFactors, StripeState, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Scheduled,
    Running,
    Completed,
    Failed,
    Aborted,
    /// The job completed but its output disappeared before it was consumed.
    Lost,
}

impl JobState {
    pub fn status(&self) -> &'static str {
        match self {
            JobState::Scheduled => "SCHEDULED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Aborted => "ABORTED",
            JobState::Lost => "LOST",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Aborted | JobState::Lost
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortReason {
    /// The controller aborted the job itself, e.g. after revival.
    Scheduler,
    NodeBanned,
    ResourceOverdraft,
    FailedChunks,
    AccountLimitExceeded,
    /// A competing job for the same stripe has already completed.
    Speculative,
    /// The job reported output on a node unknown to the controller.
    UnknownNode,
    UserRequest,
    Other,
}

impl AbortReason {
    pub fn status(&self) -> &'static str {
        match self {
            AbortReason::Scheduler => "SCHEDULER",
            AbortReason::NodeBanned => "NODE_BANNED",
            AbortReason::ResourceOverdraft => "RESOURCE_OVERDRAFT",
            AbortReason::FailedChunks => "FAILED_CHUNKS",
            AbortReason::AccountLimitExceeded => "ACCOUNT_LIMIT_EXCEEDED",
            AbortReason::Speculative => "SPECULATIVE",
            AbortReason::UnknownNode => "UNKNOWN_NODE",
            AbortReason::UserRequest => "USER_REQUEST",
            AbortReason::Other => "OTHER",
        }
    }

    /// Whether the abort is part of the scheduling churn rather than a job problem.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            AbortReason::Scheduler | AbortReason::NodeBanned | AbortReason::Speculative
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptReason {
    /// The job runs much longer than its peers and its remaining input should
    /// be handed to new jobs.
    JobSplit,
}

/// The controller-side record of one dispatched job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Joblet {
    pub job_id: JobId,
    pub task: TaskIndex,
    pub job_type: String,
    pub node: NodeDescriptor,
    pub state: JobState,
    pub schedule_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    /// The declared demand of the job without any memory reserve.
    pub estimated_resources: JobResources,
    pub resource_limits: JobResources,
    pub memory_reserve_factors: MemoryReserveFactors,
    pub statistics: JobStatistics,
    pub last_activity_time: DateTime<Utc>,
    pub suspicious: bool,
    pub cookie: PoolCookie,
    pub input_chunks: Vec<ChunkId>,
    pub chunk_lists: Vec<ChunkListId>,
    pub speculative: bool,
    pub interrupted: bool,
}

impl Joblet {
    pub fn new(
        job_id: JobId,
        task: &Task,
        node: NodeDescriptor,
        cookie: PoolCookie,
        now: DateTime<Utc>,
    ) -> Self {
        let speculative = matches!(
            task.pool().state(cookie),
            Some(StripeState::Running { jobs }) if jobs.len() > 1
        );
        Self {
            job_id,
            task: task.index(),
            job_type: task.job_type().to_string(),
            node,
            state: JobState::Scheduled,
            schedule_time: now,
            start_time: None,
            finish_time: None,
            estimated_resources: task.lower_bound_resources(1.0, 1.0),
            resource_limits: task.needed_resources(),
            memory_reserve_factors: task.memory_reserve_factors(),
            statistics: JobStatistics::new(),
            last_activity_time: now,
            suspicious: false,
            cookie,
            input_chunks: task
                .pool()
                .stripe(cookie)
                .map(|x| x.chunk_ids())
                .unwrap_or_default(),
            chunk_lists: vec![],
            speculative,
            interrupted: false,
        }
    }

    /// The time the job has been running for, if it has started.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<chrono::TimeDelta> {
        let start = self.start_time?;
        Some(self.finish_time.unwrap_or(now) - start)
    }
}
