use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::chunk::{ChunkReplica, InputChunkSpec};
use crate::error::ControllerResult;
use crate::host::SchedulingContext;
use crate::id::{CellTag, ChunkId, ChunkListId, JobId, NodeId, TaskGroupIndex, TaskIndex, TransactionId};
use crate::lifecycle::{AbortedJobSummary, CompletedJobSummary, FailedJobSummary, RunningJobSummary};
use crate::metrics::OperationProgress;
use crate::scheduler::ScheduleResult;
use crate::snapshot::{ControllerSnapshot, SnapshotCookie};
use crate::task::{TaskCapabilities, TaskResources};

/// One task of the operation as prepared by the embedding service.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub job_type: String,
    pub group: TaskGroupIndex,
    pub capabilities: TaskCapabilities,
    pub resources: TaskResources,
    /// The cell of each output table written by a job of the task.
    pub output_cells: Vec<CellTag>,
    /// The task that consumes the intermediate output of this task.
    pub destination: Option<TaskIndex>,
    /// The input chunks of each stripe.
    pub input_stripes: Vec<Vec<ChunkId>>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationPlan {
    pub tasks: Vec<TaskSpec>,
    pub input_chunks: Vec<InputChunkSpec>,
    pub transactions: Vec<TransactionId>,
}

pub enum ControllerEvent {
    Initialize {
        plan: OperationPlan,
        /// Skips the attempt to revive from the stored snapshot.
        clean_start: bool,
        result: oneshot::Sender<ControllerResult<()>>,
    },
    SnapshotDownloaded {
        plan: OperationPlan,
        data: ControllerResult<Option<Vec<u8>>>,
        result: oneshot::Sender<ControllerResult<()>>,
    },
    RevivalValidated {
        plan: OperationPlan,
        snapshot: Box<ControllerSnapshot>,
        alive: ControllerResult<bool>,
        result: oneshot::Sender<ControllerResult<()>>,
    },
    ScheduleJob {
        context: Box<dyn SchedulingContext>,
        result: oneshot::Sender<ControllerResult<ScheduleResult>>,
    },
    JobStarted {
        job_id: JobId,
        time: DateTime<Utc>,
    },
    JobRunning(RunningJobSummary),
    JobCompleted(CompletedJobSummary),
    JobFailed(FailedJobSummary),
    JobAborted(AbortedJobSummary),
    InputChunkLocated {
        chunk_id: ChunkId,
        replicas: Vec<ChunkReplica>,
        missing: bool,
    },
    IntermediateChunkLocated {
        chunk_id: ChunkId,
        replicas: Vec<ChunkReplica>,
        missing: bool,
    },
    ChunkListsAllocated {
        cell_tag: CellTag,
        count: usize,
        result: ControllerResult<Vec<ChunkListId>>,
    },
    ExecNodesUpdated {
        nodes: Vec<NodeId>,
    },
    SnapshotTick,
    SnapshotUploaded {
        cookie: SnapshotCookie,
        result: ControllerResult<()>,
    },
    CheckSuspiciousJobs,
    ObserveProgress {
        result: oneshot::Sender<OperationProgress>,
    },
    Resume,
    AbortOperation {
        reason: String,
    },
    Shutdown,
}

impl ControllerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerEvent::Initialize { .. } => "Initialize",
            ControllerEvent::SnapshotDownloaded { .. } => "SnapshotDownloaded",
            ControllerEvent::RevivalValidated { .. } => "RevivalValidated",
            ControllerEvent::ScheduleJob { .. } => "ScheduleJob",
            ControllerEvent::JobStarted { .. } => "JobStarted",
            ControllerEvent::JobRunning(_) => "JobRunning",
            ControllerEvent::JobCompleted(_) => "JobCompleted",
            ControllerEvent::JobFailed(_) => "JobFailed",
            ControllerEvent::JobAborted(_) => "JobAborted",
            ControllerEvent::InputChunkLocated { .. } => "InputChunkLocated",
            ControllerEvent::IntermediateChunkLocated { .. } => "IntermediateChunkLocated",
            ControllerEvent::ChunkListsAllocated { .. } => "ChunkListsAllocated",
            ControllerEvent::ExecNodesUpdated { .. } => "ExecNodesUpdated",
            ControllerEvent::SnapshotTick => "SnapshotTick",
            ControllerEvent::SnapshotUploaded { .. } => "SnapshotUploaded",
            ControllerEvent::CheckSuspiciousJobs => "CheckSuspiciousJobs",
            ControllerEvent::ObserveProgress { .. } => "ObserveProgress",
            ControllerEvent::Resume => "Resume",
            ControllerEvent::AbortOperation { .. } => "AbortOperation",
            ControllerEvent::Shutdown => "Shutdown",
        }
    }
}
