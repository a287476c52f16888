//! Recording fakes of the controller collaborators for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use strata_common::config::AppConfig;
use strata_telemetry::testing::MetricTester;

use crate::chunk_tracker::{ChunkAvailabilityTracker, ChunkTrackerOptions, TrackerContext};
use crate::controller::{ControllerOptions, ControllerServices};
use crate::error::{ControllerError, ControllerResult};
use crate::host::{
    ChunkProber, ControllerHost, JobNodeRecord, JobSpec, JobSpecBuilder, JobSpecError,
    NodeDescriptor, ProbeRequest, SchedulingOffer, SnapshotStorage,
};
use crate::id::{CellTag, ChunkListId, ChunkTreeId, JobId, NodeId, TransactionId};
use crate::lifecycle::{
    AbortReason, InterruptReason, JobLifecycleManager, Joblet, LifecycleContext, LifecycleOptions,
};
use crate::metrics::{ControllerMetrics, ProgressCounters};
use crate::resources::JobResources;
use crate::scheduler::{ScheduleOutcome, Scheduler, SchedulerOptions};
use crate::snapshot::{SnapshotCoordinator, SnapshotOptions};
use crate::task::{Task, TaskTable};

#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    CreateJobNode(JobNodeRecord),
    ReleaseJobs(Vec<JobId>),
    Unstage {
        chunk_tree_ids: Vec<ChunkTreeId>,
        recursive: bool,
    },
    AttachToLivePreview {
        task_title: String,
        chunk_tree_ids: Vec<ChunkTreeId>,
    },
    InterruptJob(JobId, InterruptReason),
    AbortJob(JobId, AbortReason),
    Suspended(String),
    Completed,
    Failed(String),
    Aborted(String),
    Flush,
}

#[derive(Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<HostCall>>,
    next_chunk_list: AtomicU64,
    dead_transactions: AtomicBool,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_chunk_list: AtomicU64::new(1000),
            ..Default::default()
        })
    }

    pub fn set_dead_transactions(&self, dead: bool) {
        self.dead_transactions.store(dead, Ordering::SeqCst);
    }

    fn record(&self, call: HostCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().map(|x| x.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    pub fn released_jobs(&self) -> Vec<JobId> {
        self.calls()
            .into_iter()
            .filter_map(|x| match x {
                HostCall::ReleaseJobs(ids) => Some(ids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn unstaged(&self, recursive: bool) -> Vec<ChunkTreeId> {
        self.calls()
            .into_iter()
            .filter_map(|x| match x {
                HostCall::Unstage {
                    chunk_tree_ids,
                    recursive: r,
                } if r == recursive => Some(chunk_tree_ids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn aborted_jobs(&self) -> Vec<(JobId, AbortReason)> {
        self.calls()
            .into_iter()
            .filter_map(|x| match x {
                HostCall::AbortJob(id, reason) => Some((id, reason)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ControllerHost for RecordingHost {
    fn create_job_node(&self, record: JobNodeRecord) {
        self.record(HostCall::CreateJobNode(record));
    }

    fn release_jobs(&self, job_ids: Vec<JobId>) {
        self.record(HostCall::ReleaseJobs(job_ids));
    }

    fn add_chunk_trees_to_unstage_list(&self, chunk_tree_ids: Vec<ChunkTreeId>, recursive: bool) {
        self.record(HostCall::Unstage {
            chunk_tree_ids,
            recursive,
        });
    }

    fn attach_chunk_trees_to_live_preview(&self, task_title: &str, chunk_tree_ids: Vec<ChunkTreeId>) {
        self.record(HostCall::AttachToLivePreview {
            task_title: task_title.to_string(),
            chunk_tree_ids,
        });
    }

    fn interrupt_job(&self, job_id: JobId, reason: InterruptReason) {
        self.record(HostCall::InterruptJob(job_id, reason));
    }

    fn abort_job(&self, job_id: JobId, reason: AbortReason) {
        self.record(HostCall::AbortJob(job_id, reason));
    }

    fn on_operation_suspended(&self, reason: &str) {
        self.record(HostCall::Suspended(reason.to_string()));
    }

    fn on_operation_completed(&self) {
        self.record(HostCall::Completed);
    }

    fn on_operation_failed(&self, error: &ControllerError) {
        self.record(HostCall::Failed(error.to_string()));
    }

    fn on_operation_aborted(&self, reason: &str) {
        self.record(HostCall::Aborted(reason.to_string()));
    }

    async fn flush_operation_node(&self) -> ControllerResult<()> {
        self.record(HostCall::Flush);
        Ok(())
    }

    async fn allocate_chunk_lists(
        &self,
        _cell_tag: CellTag,
        count: usize,
    ) -> ControllerResult<Vec<ChunkListId>> {
        Ok((0..count)
            .map(|_| ChunkListId::from(self.next_chunk_list.fetch_add(1, Ordering::SeqCst)))
            .collect())
    }

    async fn check_transactions(&self, _transaction_ids: Vec<TransactionId>) -> ControllerResult<bool> {
        Ok(!self.dead_transactions.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProberCall {
    Start(Vec<u64>),
    Stop,
    Restart(Vec<u64>),
}

#[derive(Default)]
pub struct RecordingProber {
    calls: Mutex<Vec<ProberCall>>,
}

impl RecordingProber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ProberCall> {
        self.calls.lock().map(|x| x.clone()).unwrap_or_default()
    }

    fn record(&self, call: ProberCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

fn chunk_values(request: &ProbeRequest) -> Vec<u64> {
    request.chunk_ids.iter().map(|x| u64::from(*x)).collect()
}

impl ChunkProber for RecordingProber {
    fn start(&self, request: ProbeRequest) {
        self.record(ProberCall::Start(chunk_values(&request)));
    }

    fn stop(&self) {
        self.record(ProberCall::Stop);
    }

    fn restart(&self, request: ProbeRequest) {
        self.record(ProberCall::Restart(chunk_values(&request)));
    }
}

/// Builds a job spec that carries the job id, or throttles every call when asked to.
#[derive(Default)]
pub struct FakeJobSpecBuilder {
    throttled: AtomicBool,
}

impl FakeJobSpecBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_throttled(&self, throttled: bool) {
        self.throttled.store(throttled, Ordering::SeqCst);
    }
}

impl JobSpecBuilder for FakeJobSpecBuilder {
    fn build_job_spec(&self, joblet: &Joblet) -> Result<JobSpec, JobSpecError> {
        if self.throttled.load(Ordering::SeqCst) {
            return Err(JobSpecError::Throttled);
        }
        Ok(JobSpec {
            payload: joblet.job_id.to_string().into_bytes(),
        })
    }
}

#[derive(Default)]
pub struct MemorySnapshotStorage {
    data: Mutex<Option<Vec<u8>>>,
}

impl MemorySnapshotStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data(&self) -> Option<Vec<u8>> {
        self.data.lock().ok().and_then(|x| x.clone())
    }
}

#[async_trait]
impl SnapshotStorage for MemorySnapshotStorage {
    async fn download_snapshot(&self) -> ControllerResult<Option<Vec<u8>>> {
        Ok(self.data.lock()?.clone())
    }

    async fn upload_snapshot(&self, data: Vec<u8>) -> ControllerResult<()> {
        *self.data.lock()? = Some(data);
        Ok(())
    }
}

pub struct TestServices {
    pub host: Arc<RecordingHost>,
    pub input_prober: Arc<RecordingProber>,
    pub intermediate_prober: Arc<RecordingProber>,
    pub snapshot_storage: Arc<MemorySnapshotStorage>,
    pub job_spec_builder: Arc<FakeJobSpecBuilder>,
    pub metrics: Arc<ControllerMetrics>,
    pub metric_tester: MetricTester,
    pub progress: Arc<ProgressCounters>,
}

impl TestServices {
    pub fn new() -> Self {
        let metric_tester = MetricTester::new();
        Self {
            host: RecordingHost::new(),
            input_prober: RecordingProber::new(),
            intermediate_prober: RecordingProber::new(),
            snapshot_storage: MemorySnapshotStorage::new(),
            job_spec_builder: FakeJobSpecBuilder::new(),
            metrics: Arc::new(ControllerMetrics::new(metric_tester.meter())),
            metric_tester,
            progress: Arc::new(ProgressCounters::new()),
        }
    }

    pub fn controller_services(&self) -> ControllerServices {
        ControllerServices {
            host: self.host.clone(),
            input_prober: self.input_prober.clone(),
            intermediate_prober: self.intermediate_prober.clone(),
            snapshot_storage: self.snapshot_storage.clone(),
            job_spec_builder: self.job_spec_builder.clone(),
            metrics: Arc::clone(&self.metrics),
            progress: Arc::clone(&self.progress),
        }
    }
}

/// Loads the default configuration with the TOML overrides, wired to fresh fakes.
pub fn test_options(overrides: &str) -> (ControllerOptions, TestServices) {
    let config = AppConfig::load_with_overrides(overrides).unwrap();
    let services = TestServices::new();
    let options = ControllerOptions::new(&config, services.controller_services());
    (options, services)
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// The controller subsystems wired together over the recording fakes,
/// without the actor around them.
pub struct TestController {
    pub services: TestServices,
    pub options: ControllerOptions,
    pub tasks: TaskTable,
    pub scheduler: Scheduler,
    pub chunk_tracker: ChunkAvailabilityTracker,
    pub lifecycle: JobLifecycleManager,
    pub snapshots: SnapshotCoordinator,
    pub known_nodes: HashSet<NodeId>,
    pub now: DateTime<Utc>,
}

impl TestController {
    /// Builds the subsystems for the tasks without activating the scheduler.
    pub fn new(overrides: &str, tasks: Vec<Task>) -> Self {
        let (options, services) = test_options(overrides);
        let tasks = TaskTable::new(tasks);
        let scheduler = Scheduler::new(SchedulerOptions::from(&options), &tasks);
        let chunk_tracker = ChunkAvailabilityTracker::new(
            ChunkTrackerOptions::from(&options),
            services.input_prober.clone(),
            services.intermediate_prober.clone(),
        );
        let lifecycle = JobLifecycleManager::new(LifecycleOptions::from(&options));
        let snapshots = SnapshotCoordinator::new(SnapshotOptions::from(&options));
        Self {
            services,
            options,
            tasks,
            scheduler,
            chunk_tracker,
            lifecycle,
            snapshots,
            known_nodes: (1..=10).map(NodeId::from).collect(),
            now: at(0),
        }
    }

    pub fn activate(&mut self) {
        self.scheduler.activate(&self.tasks);
        self.scheduler.add_all_pending_hints(&mut self.tasks);
    }

    /// Offers the node to the scheduler and registers the started joblet.
    pub fn offer(&mut self, node: u64, limits: JobResources) -> ScheduleOutcome {
        let offer = SchedulingOffer {
            node: NodeDescriptor::new(NodeId::from(node), format!("node-{node}")),
            resource_limits: limits,
            now: self.now,
        };
        let outcome = self
            .scheduler
            .schedule(
                &offer,
                &mut self.tasks,
                true,
                self.services.job_spec_builder.as_ref(),
            )
            .unwrap();
        if let Some(joblet) = outcome.joblet.clone() {
            self.lifecycle.register(joblet);
        }
        outcome
    }

    /// Schedules a job on the node and returns its id.
    pub fn start_job(&mut self, node: u64) -> JobId {
        let outcome = self.offer(node, JobResources::new(100.0, 1 << 40));
        outcome.result.start.unwrap().job_id
    }

    pub fn with_lifecycle<T>(
        &mut self,
        f: impl FnOnce(&mut JobLifecycleManager, &mut LifecycleContext<'_>) -> T,
    ) -> T {
        let host: &dyn ControllerHost = self.services.host.as_ref();
        let mut cx = LifecycleContext {
            tasks: &mut self.tasks,
            scheduler: &mut self.scheduler,
            chunk_tracker: &mut self.chunk_tracker,
            snapshots: &mut self.snapshots,
            host,
            metrics: self.services.metrics.as_ref(),
            known_nodes: &self.known_nodes,
            now: self.now,
        };
        f(&mut self.lifecycle, &mut cx)
    }

    pub fn with_tracker<T>(
        &mut self,
        f: impl FnOnce(&mut ChunkAvailabilityTracker, &mut TrackerContext<'_>) -> T,
    ) -> T {
        let mut cx = TrackerContext {
            tasks: &mut self.tasks,
            scheduler: &mut self.scheduler,
            snapshots: &mut self.snapshots,
        };
        f(&mut self.chunk_tracker, &mut cx)
    }

    pub fn validate(&self) {
        self.scheduler.validate(&self.tasks).unwrap();
        self.chunk_tracker.validate().unwrap();
    }
}
