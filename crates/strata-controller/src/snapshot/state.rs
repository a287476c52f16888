use serde::{Deserialize, Serialize};

use crate::chunk_tracker::ChunkTrackerState;
use crate::error::{ControllerError, ControllerResult};
use crate::id::{ChunkId, ChunkTreeId, JobId, TransactionId};
use crate::lifecycle::LifecycleState;
use crate::scheduler::SchedulerState;
use crate::snapshot::ReleaseQueue;
use crate::task::TaskTable;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotQueues {
    pub completed_jobs: ReleaseQueue<JobId>,
    /// The chunks of intermediate stripes that were fully consumed.
    pub stripe_lists: ReleaseQueue<Vec<ChunkId>>,
    pub chunk_trees: ReleaseQueue<ChunkTreeId>,
}

/// The serialized controller state at the point a snapshot was started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub version: u32,
    pub transactions: Vec<TransactionId>,
    pub tasks: TaskTable,
    pub chunk_tracker: ChunkTrackerState,
    pub scheduler: SchedulerState,
    pub lifecycle: LifecycleState,
    pub queues: SnapshotQueues,
}

impl ControllerSnapshot {
    pub fn encode(&self) -> ControllerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> ControllerResult<Self> {
        let snapshot: Self = serde_json::from_slice(data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ControllerError::SnapshotError(format!(
                "unsupported snapshot version {}, expected {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}
