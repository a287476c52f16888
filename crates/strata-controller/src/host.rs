use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, ControllerResult};
use crate::id::{CellTag, ChunkId, ChunkListId, ChunkTreeId, JobId, NodeId, TransactionId};
use crate::lifecycle::{AbortReason, InterruptReason, Joblet};
use crate::resources::JobResources;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub address: String,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

/// A resource offer from the cluster scheduler.
pub trait SchedulingContext: Send {
    fn node(&self) -> &NodeDescriptor;
    fn resource_limits(&self) -> &JobResources;
    fn now(&self) -> DateTime<Utc>;
}

/// A plain [`SchedulingContext`] with fixed values.
#[derive(Debug, Clone)]
pub struct SchedulingOffer {
    pub node: NodeDescriptor,
    pub resource_limits: JobResources,
    pub now: DateTime<Utc>,
}

impl SchedulingContext for SchedulingOffer {
    fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    fn resource_limits(&self) -> &JobResources {
        &self.resource_limits
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub chunk_ids: Vec<ChunkId>,
    pub max_chunks_per_request: usize,
}

/// A background service that locates chunk replicas.
///
/// The prober reports results back to the controller asynchronously,
/// at least once and possibly more than once per chunk.
pub trait ChunkProber: Send + Sync {
    fn start(&self, request: ProbeRequest);
    fn stop(&self);
    fn restart(&self, request: ProbeRequest);
}

/// The wire-level job specification. The content is opaque to the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSpec {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpecError {
    /// The builder is overloaded. The job should be retried on another offer.
    Throttled,
    Failed(String),
}

pub trait JobSpecBuilder: Send + Sync {
    fn build_job_spec(&self, joblet: &Joblet) -> Result<JobSpec, JobSpecError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNodeRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub node_address: String,
    pub state: &'static str,
    pub stderr_chunk: Option<ChunkId>,
}

/// The callbacks into the service that embeds the controller.
///
/// Synchronous callbacks are fire-and-forget. Failures of asynchronous
/// callbacks are logged by the controller unless stated otherwise.
#[async_trait]
pub trait ControllerHost: Send + Sync {
    fn create_job_node(&self, record: JobNodeRecord);
    fn release_jobs(&self, job_ids: Vec<JobId>);
    fn add_chunk_trees_to_unstage_list(&self, chunk_tree_ids: Vec<ChunkTreeId>, recursive: bool);
    fn attach_chunk_trees_to_live_preview(&self, task_title: &str, chunk_tree_ids: Vec<ChunkTreeId>);
    fn interrupt_job(&self, job_id: JobId, reason: InterruptReason);
    fn abort_job(&self, job_id: JobId, reason: AbortReason);
    fn on_operation_suspended(&self, reason: &str);
    fn on_operation_completed(&self);
    fn on_operation_failed(&self, error: &ControllerError);
    fn on_operation_aborted(&self, reason: &str);
    async fn flush_operation_node(&self) -> ControllerResult<()>;
    async fn allocate_chunk_lists(
        &self,
        cell_tag: CellTag,
        count: usize,
    ) -> ControllerResult<Vec<ChunkListId>>;
    /// Returns whether all the transactions are still alive.
    async fn check_transactions(&self, transaction_ids: Vec<TransactionId>) -> ControllerResult<bool>;
}

#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Returns [`None`] when no snapshot has been stored.
    async fn download_snapshot(&self) -> ControllerResult<Option<Vec<u8>>>;
    async fn upload_snapshot(&self, data: Vec<u8>) -> ControllerResult<()>;
}
