mod digest;
mod pool;

use std::time::Duration;

use chrono::{DateTime, Utc};
pub use digest::LogDigest;
use log::debug;
pub use pool::{ChunkPool, StripeState};
use serde::{Deserialize, Serialize};

use crate::id::{CellTag, JobId, NodeId, PoolCookie, TaskGroupIndex, TaskIndex};
use crate::resources::JobResources;
use crate::statistics::{JobStatistics, JOB_PROXY_MAX_MEMORY, USER_JOB_MAX_MEMORY};

/// The behaviors a task opts into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCapabilities {
    /// Whether the output of a completed job can be regenerated on demand
    /// by running the job again.
    pub restartable: bool,
    /// Whether the task prefers nodes holding replicas of its input.
    pub has_input_locality: bool,
    pub supports_speculative: bool,
    pub interruptible: bool,
    pub live_preview: bool,
}

/// The declared resource demand of one job of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResources {
    pub user_slots: u32,
    pub cpu: f64,
    pub network: u32,
    pub user_job_memory: u64,
    pub job_proxy_memory: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryReserve {
    pub user_job_quantile: f64,
    pub job_proxy_quantile: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryReserveFactors {
    pub user_job: f64,
    pub job_proxy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    index: TaskIndex,
    group: TaskGroupIndex,
    title: String,
    job_type: String,
    capabilities: TaskCapabilities,
    resources: TaskResources,
    memory_reserve: MemoryReserve,
    user_job_memory_digest: LogDigest,
    job_proxy_memory_digest: LogDigest,
    locality_timeout: Duration,
    /// The first time the task was seen as a non-local candidate.
    delayed_time: Option<DateTime<Utc>>,
    output_cells: Vec<CellTag>,
    destination: Option<TaskIndex>,
    upstream: Vec<TaskIndex>,
    pool: ChunkPool,
    completed: bool,
    cached_pending: usize,
    cached_needed: JobResources,
}

pub struct TaskArgs {
    pub index: TaskIndex,
    pub group: TaskGroupIndex,
    pub title: String,
    pub job_type: String,
    pub capabilities: TaskCapabilities,
    pub resources: TaskResources,
    pub memory_reserve: MemoryReserve,
    pub user_job_memory_digest: LogDigest,
    pub job_proxy_memory_digest: LogDigest,
    pub locality_timeout: Duration,
    pub output_cells: Vec<CellTag>,
    pub destination: Option<TaskIndex>,
    pub upstream: Vec<TaskIndex>,
}

impl Task {
    pub fn new(args: TaskArgs) -> Self {
        Self {
            index: args.index,
            group: args.group,
            title: args.title,
            job_type: args.job_type,
            capabilities: args.capabilities,
            resources: args.resources,
            memory_reserve: args.memory_reserve,
            user_job_memory_digest: args.user_job_memory_digest,
            job_proxy_memory_digest: args.job_proxy_memory_digest,
            locality_timeout: args.locality_timeout,
            delayed_time: None,
            output_cells: args.output_cells,
            destination: args.destination,
            upstream: args.upstream,
            pool: ChunkPool::new(),
            completed: false,
            cached_pending: 0,
            cached_needed: JobResources::default(),
        }
    }

    pub fn index(&self) -> TaskIndex {
        self.index
    }

    pub fn group(&self) -> TaskGroupIndex {
        self.group
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn capabilities(&self) -> &TaskCapabilities {
        &self.capabilities
    }

    pub fn output_cells(&self) -> &[CellTag] {
        &self.output_cells
    }

    pub fn destination(&self) -> Option<TaskIndex> {
        self.destination
    }

    pub fn upstream(&self) -> &[TaskIndex] {
        &self.upstream
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ChunkPool {
        &mut self.pool
    }

    pub fn locality_timeout(&self) -> Duration {
        self.locality_timeout
    }

    pub fn delayed_time(&self) -> Option<DateTime<Utc>> {
        self.delayed_time
    }

    pub fn set_delayed_time(&mut self, time: DateTime<Utc>) {
        self.delayed_time = Some(time);
    }

    pub fn reset_delayed_time(&mut self) {
        self.delayed_time = None;
    }

    pub fn memory_reserve_factors(&self) -> MemoryReserveFactors {
        MemoryReserveFactors {
            user_job: self
                .user_job_memory_digest
                .quantile(self.memory_reserve.user_job_quantile),
            job_proxy: self
                .job_proxy_memory_digest
                .quantile(self.memory_reserve.job_proxy_quantile),
        }
    }

    /// The resources requested for the next job of the task.
    pub fn needed_resources(&self) -> JobResources {
        let factors = self.memory_reserve_factors();
        self.resources_with_factors(factors.user_job, factors.job_proxy)
    }

    /// A lower bound of [`Task::needed_resources`] that holds whatever the digests learn.
    pub fn lower_bound_resources(&self, user_job_factor: f64, job_proxy_factor: f64) -> JobResources {
        self.resources_with_factors(user_job_factor, job_proxy_factor)
    }

    fn resources_with_factors(&self, user_job_factor: f64, job_proxy_factor: f64) -> JobResources {
        let user_job = (self.resources.user_job_memory as f64 * user_job_factor).ceil() as u64;
        let job_proxy = (self.resources.job_proxy_memory as f64 * job_proxy_factor).ceil() as u64;
        JobResources {
            user_slots: self.resources.user_slots,
            cpu: self.resources.cpu,
            memory: user_job.saturating_add(job_proxy),
            network: self.resources.network,
        }
    }

    /// The least resources any job of the task can request.
    pub fn min_needed_resources(&self) -> JobResources {
        self.resources_with_factors(
            self.user_job_memory_digest.lower_bound(),
            self.job_proxy_memory_digest.lower_bound(),
        )
    }

    pub fn pending_job_count(&self) -> usize {
        if self.completed {
            0
        } else {
            self.pool.pending_count()
        }
    }

    pub fn total_job_count(&self) -> usize {
        self.pool.total_count()
    }

    pub fn running_job_count(&self) -> usize {
        self.pool.running_count()
    }

    pub fn locality(&self, node_id: NodeId) -> u64 {
        if self.capabilities.has_input_locality {
            self.pool.locality(node_id)
        } else {
            0
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Marks the task completed once its pool has no more work. Returns whether
    /// the task has just been completed.
    pub fn check_completed(&mut self) -> bool {
        if !self.completed && self.pool.is_completed() {
            debug!("task {} completed", self.title);
            self.completed = true;
            return true;
        }
        false
    }

    /// Returns a completed cookie to the pool after its output was lost.
    pub fn mark_output_lost(&mut self, cookie: PoolCookie) -> bool {
        if !self.pool.lost(cookie) {
            return false;
        }
        self.completed = false;
        true
    }

    pub fn should_abort_job(&self, cookie: PoolCookie, job_id: JobId) -> bool {
        self.pool.has_competitor_completed(cookie, job_id)
    }

    /// Feeds the digests with the observed peak memory relative to the declared demand.
    pub fn update_memory_digests(&mut self, statistics: &JobStatistics) {
        if let Some(sample) = ratio(statistics.get(USER_JOB_MAX_MEMORY), self.resources.user_job_memory) {
            self.user_job_memory_digest.add_sample(sample);
        }
        if let Some(sample) = ratio(
            statistics.get(JOB_PROXY_MAX_MEMORY),
            self.resources.job_proxy_memory,
        ) {
            self.job_proxy_memory_digest.add_sample(sample);
        }
    }

    /// Feeds the digests after a job was aborted for exceeding its memory reserve.
    /// The sample is at least the reserve factor the job ran with, scaled by the overdraft factor.
    pub fn update_memory_digests_on_overdraft(
        &mut self,
        statistics: &JobStatistics,
        factors: MemoryReserveFactors,
        overdraft_factor: f64,
    ) {
        if self.resources.user_job_memory > 0 {
            let observed = ratio(statistics.get(USER_JOB_MAX_MEMORY), self.resources.user_job_memory)
                .unwrap_or(0.0);
            self.user_job_memory_digest
                .add_sample(observed.max(factors.user_job * overdraft_factor));
        }
        if self.resources.job_proxy_memory > 0 {
            let observed = ratio(
                statistics.get(JOB_PROXY_MAX_MEMORY),
                self.resources.job_proxy_memory,
            )
            .unwrap_or(0.0);
            self.job_proxy_memory_digest
                .add_sample(observed.max(factors.job_proxy * overdraft_factor));
        }
    }
}

fn ratio(value: Option<i64>, base: u64) -> Option<f64> {
    let value = value?;
    if base == 0 || value < 0 {
        return None;
    }
    Some(value as f64 / base as f64)
}

/// The arena of tasks addressed by [`TaskIndex`], with aggregate counters kept in
/// sync with every refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTable {
    tasks: Vec<Task>,
    pending_job_count: usize,
}

impl TaskTable {
    pub fn new(tasks: Vec<Task>) -> Self {
        let mut table = Self {
            tasks,
            pending_job_count: 0,
        };
        for i in 0..table.tasks.len() {
            table.refresh(TaskIndex::from(i));
        }
        table
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, index: TaskIndex) -> Option<&Task> {
        self.tasks.get(index.index())
    }

    pub fn get_mut(&mut self, index: TaskIndex) -> Option<&mut Task> {
        self.tasks.get_mut(index.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn indices(&self) -> impl Iterator<Item = TaskIndex> {
        (0..self.tasks.len()).map(TaskIndex::from)
    }

    /// Recomputes the cached counters of the task.
    pub fn refresh(&mut self, index: TaskIndex) {
        let Some(task) = self.tasks.get_mut(index.index()) else {
            return;
        };
        let pending = task.pending_job_count();
        self.pending_job_count = self.pending_job_count - task.cached_pending + pending;
        task.cached_pending = pending;
        task.cached_needed = task.needed_resources().scale(pending);
    }

    pub fn pending_job_count(&self) -> usize {
        self.pending_job_count
    }

    pub fn needed_resources(&self) -> JobResources {
        self.tasks
            .iter()
            .fold(JobResources::default(), |acc, x| acc.saturating_add(&x.cached_needed))
    }

    pub fn all_completed(&self) -> bool {
        self.tasks.iter().all(|x| x.completed)
    }
}
