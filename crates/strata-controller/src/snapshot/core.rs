use log::{info, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::host::ControllerHost;
use crate::id::{ChunkId, ChunkTreeId, JobId};
use crate::snapshot::{QueueCheckpoints, SnapshotCookie, SnapshotCoordinator, SnapshotQueues};

impl SnapshotCoordinator {
    pub fn push_completed_job(&mut self, job_id: JobId) {
        self.queues.completed_jobs.push(job_id);
    }

    pub fn push_stripe_list(&mut self, chunks: Vec<ChunkId>) {
        if !chunks.is_empty() {
            self.queues.stripe_lists.push(chunks);
        }
    }

    pub fn enqueue_chunk_trees(&mut self, chunk_tree_ids: Vec<ChunkTreeId>) {
        for id in chunk_tree_ids {
            self.queues.chunk_trees.push(id);
        }
    }

    /// Unstages the chunk trees now, or after the next snapshot when the trees
    /// may still be referenced by the last durable one.
    pub fn release_chunk_trees(
        &mut self,
        chunk_tree_ids: Vec<ChunkTreeId>,
        wait_snapshot: bool,
        host: &dyn ControllerHost,
    ) {
        if chunk_tree_ids.is_empty() {
            return;
        }
        if wait_snapshot {
            self.enqueue_chunk_trees(chunk_tree_ids);
        } else {
            host.add_chunk_trees_to_unstage_list(chunk_tree_ids, true);
        }
    }

    pub fn on_snapshot_started(&mut self) -> SnapshotCookie {
        if let Some(recent) = self.recent {
            warn!(
                "starting next snapshot without completing previous one {}",
                recent.snapshot_index
            );
        }
        let snapshot_index = self.next_snapshot_index;
        self.next_snapshot_index += 1;
        let checkpoints = QueueCheckpoints {
            snapshot_index,
            completed_jobs: self.queues.completed_jobs.checkpoint(),
            stripe_lists: self.queues.stripe_lists.checkpoint(),
            chunk_trees: self.queues.chunk_trees.checkpoint(),
        };
        info!(
            "storing snapshot cookies: completed_jobs={} stripe_lists={} chunk_trees={} snapshot_index={snapshot_index}",
            checkpoints.completed_jobs, checkpoints.stripe_lists, checkpoints.chunk_trees
        );
        self.recent = Some(checkpoints);
        SnapshotCookie { snapshot_index }
    }

    /// Releases everything enqueued before the snapshot was started.
    /// The cookie must match the most recently started snapshot.
    pub fn on_snapshot_completed(
        &mut self,
        cookie: SnapshotCookie,
        host: &dyn ControllerHost,
    ) -> ControllerResult<()> {
        let Some(checkpoints) = self.recent else {
            return Err(ControllerError::internal(format!(
                "snapshot {} completed but no snapshot was started",
                cookie.snapshot_index
            )));
        };
        if checkpoints.snapshot_index != cookie.snapshot_index {
            return Err(ControllerError::internal(format!(
                "snapshot {} completed but the most recent snapshot is {}",
                cookie.snapshot_index, checkpoints.snapshot_index
            )));
        }
        self.recent = None;

        let head = self.queues.completed_jobs.head_cookie();
        let job_ids = self.queues.completed_jobs.release(checkpoints.completed_jobs);
        info!(
            "releasing jobs on snapshot completion: cookie={} head={head} job_count={} snapshot_index={}",
            checkpoints.completed_jobs,
            job_ids.len(),
            cookie.snapshot_index
        );
        if !job_ids.is_empty() {
            host.release_jobs(job_ids);
        }

        let stripe_lists = self.queues.stripe_lists.release(checkpoints.stripe_lists);
        info!(
            "releasing stripe lists: count={} snapshot_index={}",
            stripe_lists.len(),
            cookie.snapshot_index
        );
        let chunks = stripe_lists
            .into_iter()
            .flatten()
            .map(ChunkTreeId::from)
            .collect::<Vec<_>>();
        if !chunks.is_empty() {
            host.add_chunk_trees_to_unstage_list(chunks, false);
        }

        let chunk_trees = self.queues.chunk_trees.release(checkpoints.chunk_trees);
        info!(
            "releasing chunk trees: count={} snapshot_index={}",
            chunk_trees.len(),
            cookie.snapshot_index
        );
        if !chunk_trees.is_empty() {
            host.add_chunk_trees_to_unstage_list(chunk_trees, true);
        }
        Ok(())
    }

    /// Forgets a snapshot attempt that could not be stored.
    pub fn on_snapshot_failed(&mut self, cookie: SnapshotCookie) {
        if self
            .recent
            .is_some_and(|x| x.snapshot_index == cookie.snapshot_index)
        {
            warn!("snapshot {} failed", cookie.snapshot_index);
            self.recent = None;
        }
    }

    pub fn is_snapshot_in_progress(&self) -> bool {
        self.recent.is_some()
    }

    /// The cookie of the most recently started snapshot that has not finished.
    pub fn recent_snapshot(&self) -> Option<SnapshotCookie> {
        self.recent.map(|x| SnapshotCookie {
            snapshot_index: x.snapshot_index,
        })
    }

    pub fn queues(&self) -> &SnapshotQueues {
        &self.queues
    }

    pub fn restore(&mut self, queues: SnapshotQueues) {
        self.queues = queues;
        self.recent = None;
    }

    /// Releases every remaining completed job regardless of checkpoints.
    pub fn dispose(&mut self, host: &dyn ControllerHost) {
        let job_ids = self.queues.completed_jobs.release_all();
        if !job_ids.is_empty() {
            info!("releasing {} jobs on dispose", job_ids.len());
            host.release_jobs(job_ids);
        }
    }
}
