use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::chunk::InputChunkSpec;
use crate::id::{ChunkId, JobId, PoolCookie, TaskIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputChunkState {
    Active,
    /// The chunk is unavailable and the operation waits for it to come back.
    Waiting,
    /// The chunk was removed from every stripe and is never read again.
    Skipped,
}

impl InputChunkState {
    pub fn status(&self) -> &'static str {
        match self {
            InputChunkState::Active => "ACTIVE",
            InputChunkState::Waiting => "WAITING",
            InputChunkState::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputChunkDescriptor {
    /// The chunk spec with the most recently known replicas.
    pub spec: InputChunkSpec,
    pub state: InputChunkState,
    /// Indices into the stripe descriptor table.
    pub stripes: Vec<usize>,
}

/// Records which task consumed a stripe and under what pool cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStripeDescriptor {
    pub task: TaskIndex,
    pub cookie: PoolCookie,
    pub waiting_chunk_count: usize,
}

/// The origin of intermediate chunks produced by a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedJobRecord {
    pub job_id: JobId,
    pub source_task: TaskIndex,
    pub output_cookie: PoolCookie,
    pub destination_task: TaskIndex,
    pub input_cookie: PoolCookie,
    /// Whether the output can be regenerated by running the job again.
    pub restartable: bool,
    /// Whether the destination cookie is suspended because of this job.
    pub suspended: bool,
    /// Whether the output was lost and the source cookie is pending regeneration.
    pub lost: bool,
    pub chunks: Vec<ChunkId>,
    pub unavailable_chunks: BTreeSet<ChunkId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkTrackerState {
    pub input_chunks: HashMap<ChunkId, InputChunkDescriptor>,
    pub stripes: Vec<ChunkStripeDescriptor>,
    pub waiting_chunk_count: usize,
    pub completed_jobs: Vec<CompletedJobRecord>,
    /// Indices into the completed job records keyed by intermediate chunk.
    pub chunk_origins: HashMap<ChunkId, usize>,
    pub unavailable_intermediate_chunk_count: usize,
    pub lost_job_count: usize,
}
