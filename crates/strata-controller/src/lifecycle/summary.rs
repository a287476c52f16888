use chrono::{DateTime, Utc};

use crate::chunk::ChunkReplica;
use crate::id::{ChunkId, JobId};
use crate::lifecycle::AbortReason;
use crate::statistics::JobStatistics;

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub chunk_id: ChunkId,
    pub data_weight: u64,
    pub replicas: Vec<ChunkReplica>,
}

#[derive(Debug, Clone)]
pub struct RunningJobSummary {
    pub job_id: JobId,
    pub statistics: JobStatistics,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompletedJobSummary {
    pub job_id: JobId,
    pub statistics: JobStatistics,
    pub output_chunks: Vec<OutputChunk>,
    /// The job finished without producing output that must be kept.
    pub abandoned: bool,
    /// The input an interrupted job did not get to read.
    pub unread_chunks: Vec<ChunkId>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailedJobSummary {
    pub job_id: JobId,
    pub statistics: JobStatistics,
    pub error: String,
    /// The error cannot be fixed by running the job again.
    pub fatal: bool,
    pub stderr_chunk: Option<ChunkId>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AbortedJobSummary {
    pub job_id: JobId,
    pub reason: AbortReason,
    pub statistics: JobStatistics,
    pub failed_chunks: Vec<ChunkId>,
    /// The job was aborted by the cluster scheduler, which cleans it up itself.
    pub by_scheduler: bool,
    pub time: DateTime<Utc>,
}

impl AbortedJobSummary {
    pub fn new(job_id: JobId, reason: AbortReason, time: DateTime<Utc>) -> Self {
        Self {
            job_id,
            reason,
            statistics: JobStatistics::new(),
            failed_chunks: vec![],
            by_scheduler: false,
            time,
        }
    }
}
