//! In-memory collaborators for driving the controller actor end to end.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use strata_common::config::AppConfig;
use strata_controller::chunk::{ChunkReplica, ErasureCodec, InputChunkSpec};
use strata_controller::controller::{
    ControllerActor, ControllerEvent, ControllerOptions, ControllerServices, OperationPlan,
    TaskSpec,
};
use strata_controller::error::{ControllerError, ControllerResult};
use strata_controller::host::{
    ChunkProber, ControllerHost, JobNodeRecord, JobSpec, JobSpecBuilder, JobSpecError,
    NodeDescriptor, ProbeRequest, SchedulingOffer, SnapshotStorage,
};
use strata_controller::id::{
    CellTag, ChunkId, ChunkListId, ChunkTreeId, JobId, NodeId, TaskGroupIndex, TransactionId,
};
use strata_controller::lifecycle::{
    AbortReason, CompletedJobSummary, FailedJobSummary, InterruptReason, Joblet,
};
use strata_controller::metrics::{ControllerMetrics, OperationProgress, ProgressCounters};
use strata_controller::resources::JobResources;
use strata_controller::scheduler::ScheduleResult;
use strata_controller::statistics::JobStatistics;
use strata_controller::task::{TaskCapabilities, TaskResources};
use strata_server::actor::ActorHandle;
use strata_telemetry::testing::MetricTester;
use tokio::sync::oneshot;

pub fn init_logger() {
    let config = AppConfig::load().unwrap();
    // Another test may have installed the logger already.
    let _ = strata_telemetry::init_logger(&config.telemetry);
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Completed,
    Failed(String),
    Aborted(String),
}

#[derive(Default)]
pub struct Host {
    released: Mutex<Vec<JobId>>,
    aborted: Mutex<Vec<JobId>>,
    outcome: Mutex<Option<OperationOutcome>>,
    flushes: AtomicU64,
    next_chunk_list: AtomicU64,
    dead_transactions: AtomicBool,
}

impl Host {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn released_jobs(&self) -> Vec<JobId> {
        self.released.lock().unwrap().clone()
    }

    pub fn aborted_jobs(&self) -> Vec<JobId> {
        self.aborted.lock().unwrap().clone()
    }

    pub fn outcome(&self) -> Option<OperationOutcome> {
        self.outcome.lock().unwrap().clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn set_dead_transactions(&self, dead: bool) {
        self.dead_transactions.store(dead, Ordering::SeqCst);
    }

    fn finish(&self, outcome: OperationOutcome) {
        *self.outcome.lock().unwrap() = Some(outcome);
    }
}

#[async_trait]
impl ControllerHost for Host {
    fn create_job_node(&self, _record: JobNodeRecord) {}

    fn release_jobs(&self, job_ids: Vec<JobId>) {
        self.released.lock().unwrap().extend(job_ids);
    }

    fn add_chunk_trees_to_unstage_list(&self, _chunk_tree_ids: Vec<ChunkTreeId>, _recursive: bool) {}

    fn attach_chunk_trees_to_live_preview(&self, _task_title: &str, _chunk_tree_ids: Vec<ChunkTreeId>) {}

    fn interrupt_job(&self, _job_id: JobId, _reason: InterruptReason) {}

    fn abort_job(&self, job_id: JobId, _reason: AbortReason) {
        self.aborted.lock().unwrap().push(job_id);
    }

    fn on_operation_suspended(&self, _reason: &str) {}

    fn on_operation_completed(&self) {
        self.finish(OperationOutcome::Completed);
    }

    fn on_operation_failed(&self, error: &ControllerError) {
        self.finish(OperationOutcome::Failed(error.to_string()));
    }

    fn on_operation_aborted(&self, reason: &str) {
        self.finish(OperationOutcome::Aborted(reason.to_string()));
    }

    async fn flush_operation_node(&self) -> ControllerResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn allocate_chunk_lists(
        &self,
        _cell_tag: CellTag,
        count: usize,
    ) -> ControllerResult<Vec<ChunkListId>> {
        Ok((0..count)
            .map(|_| ChunkListId::from(self.next_chunk_list.fetch_add(1, Ordering::SeqCst) + 1))
            .collect())
    }

    async fn check_transactions(&self, _transaction_ids: Vec<TransactionId>) -> ControllerResult<bool> {
        Ok(!self.dead_transactions.load(Ordering::SeqCst))
    }
}

pub struct IdleProber;

impl ChunkProber for IdleProber {
    fn start(&self, _request: ProbeRequest) {}

    fn stop(&self) {}

    fn restart(&self, _request: ProbeRequest) {}
}

#[derive(Default)]
pub struct Storage {
    data: Mutex<Option<Vec<u8>>>,
}

impl Storage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn has_snapshot(&self) -> bool {
        self.data.lock().unwrap().is_some()
    }
}

#[async_trait]
impl SnapshotStorage for Storage {
    async fn download_snapshot(&self) -> ControllerResult<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().clone())
    }

    async fn upload_snapshot(&self, data: Vec<u8>) -> ControllerResult<()> {
        *self.data.lock().unwrap() = Some(data);
        Ok(())
    }
}

pub struct SpecBuilder;

impl JobSpecBuilder for SpecBuilder {
    fn build_job_spec(&self, joblet: &Joblet) -> Result<JobSpec, JobSpecError> {
        Ok(JobSpec {
            payload: joblet.job_id.to_string().into_bytes(),
        })
    }
}

pub struct Cluster {
    pub host: Arc<Host>,
    pub storage: Arc<Storage>,
    pub metrics: Arc<ControllerMetrics>,
    pub metric_tester: MetricTester,
    pub progress: Arc<ProgressCounters>,
}

impl Cluster {
    pub fn new() -> Self {
        let metric_tester = MetricTester::new();
        Self {
            host: Host::new(),
            storage: Storage::new(),
            metrics: Arc::new(ControllerMetrics::new(metric_tester.meter())),
            metric_tester,
            progress: Arc::new(ProgressCounters::new()),
        }
    }

    pub fn start(&self, overrides: &str) -> ActorHandle<ControllerActor> {
        let config = AppConfig::load_with_overrides(overrides).unwrap();
        let prober: Arc<dyn ChunkProber> = Arc::new(IdleProber);
        let services = ControllerServices {
            host: self.host.clone(),
            input_prober: prober.clone(),
            intermediate_prober: prober,
            snapshot_storage: self.storage.clone(),
            job_spec_builder: Arc::new(SpecBuilder),
            metrics: self.metrics.clone(),
            progress: self.progress.clone(),
        };
        ActorHandle::new(ControllerOptions::new(&config, services))
    }
}

/// A single map task with one stripe per input chunk, all chunks on node 1.
pub fn map_plan(chunks: u64) -> OperationPlan {
    OperationPlan {
        tasks: vec![TaskSpec {
            title: "map".to_string(),
            job_type: "map".to_string(),
            group: TaskGroupIndex::from(0),
            capabilities: TaskCapabilities {
                has_input_locality: true,
                ..Default::default()
            },
            resources: TaskResources {
                user_slots: 1,
                cpu: 1.0,
                network: 0,
                user_job_memory: 1 << 20,
                job_proxy_memory: 1 << 10,
            },
            output_cells: vec![],
            destination: None,
            input_stripes: (1..=chunks).map(|x| vec![ChunkId::from(x)]).collect(),
        }],
        input_chunks: (1..=chunks)
            .map(|x| InputChunkSpec {
                chunk_id: ChunkId::from(x),
                replicas: vec![ChunkReplica::new(NodeId::from(1))],
                codec: ErasureCodec::None,
                data_weight: 100,
            })
            .collect(),
        transactions: vec![TransactionId::from(1)],
    }
}

pub async fn initialize(
    handle: &ActorHandle<ControllerActor>,
    plan: OperationPlan,
    clean_start: bool,
) -> ControllerResult<()> {
    let (tx, rx) = oneshot::channel();
    handle
        .send(ControllerEvent::Initialize {
            plan,
            clean_start,
            result: tx,
        })
        .await?;
    rx.await.unwrap()
}

pub async fn schedule(handle: &ActorHandle<ControllerActor>, node: u64) -> ScheduleResult {
    let (tx, rx) = oneshot::channel();
    let offer = SchedulingOffer {
        node: NodeDescriptor::new(NodeId::from(node), format!("node-{node}")),
        resource_limits: JobResources::new(16.0, 1 << 34),
        now: Utc::now(),
    };
    handle
        .send(ControllerEvent::ScheduleJob {
            context: Box::new(offer),
            result: tx,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap()
}

/// Schedules a job on node 1 and returns its id.
pub async fn start_job(handle: &ActorHandle<ControllerActor>) -> JobId {
    let result = schedule(handle, 1).await;
    let job_id = result.start.unwrap().job_id;
    handle
        .send(ControllerEvent::JobStarted {
            job_id,
            time: Utc::now(),
        })
        .await
        .unwrap();
    job_id
}

pub async fn complete_job(handle: &ActorHandle<ControllerActor>, job_id: JobId) {
    handle
        .send(ControllerEvent::JobCompleted(CompletedJobSummary {
            job_id,
            statistics: JobStatistics::new(),
            output_chunks: vec![],
            abandoned: false,
            unread_chunks: vec![],
            time: Utc::now(),
        }))
        .await
        .unwrap();
}

pub async fn fail_job(handle: &ActorHandle<ControllerActor>, job_id: JobId, fatal: bool) {
    handle
        .send(ControllerEvent::JobFailed(FailedJobSummary {
            job_id,
            statistics: JobStatistics::new(),
            error: "exit code 1".to_string(),
            fatal,
            stderr_chunk: None,
            time: Utc::now(),
        }))
        .await
        .unwrap();
}

/// Returns the progress once every event sent before has been handled.
pub async fn progress(handle: &ActorHandle<ControllerActor>) -> OperationProgress {
    let (tx, rx) = oneshot::channel();
    handle
        .send(ControllerEvent::ObserveProgress { result: tx })
        .await
        .unwrap();
    rx.await.unwrap()
}

/// Polls until the condition holds, since background work reports back asynchronously.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(condition(), "condition not met in time");
}

pub async fn shutdown(handle: ActorHandle<ControllerActor>) {
    handle.send(ControllerEvent::Shutdown).await.unwrap();
    handle.wait_for_stop().await;
}
