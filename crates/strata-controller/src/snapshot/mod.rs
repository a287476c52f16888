mod core;
mod options;
mod release_queue;
mod state;

pub use options::SnapshotOptions;
pub use release_queue::{ReleaseCookie, ReleaseQueue};
pub use state::{ControllerSnapshot, SnapshotQueues, SNAPSHOT_VERSION};

/// Identifies one snapshot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCookie {
    pub snapshot_index: u64,
}

#[derive(Debug, Clone, Copy)]
struct QueueCheckpoints {
    snapshot_index: u64,
    completed_jobs: ReleaseCookie,
    stripe_lists: ReleaseCookie,
    chunk_trees: ReleaseCookie,
}

/// Defers side-effecting releases until a snapshot that covers them is durable.
pub struct SnapshotCoordinator {
    options: SnapshotOptions,
    queues: SnapshotQueues,
    next_snapshot_index: u64,
    /// The checkpoints of the most recently started snapshot.
    recent: Option<QueueCheckpoints>,
}

impl SnapshotCoordinator {
    pub fn new(options: SnapshotOptions) -> Self {
        Self {
            options,
            queues: SnapshotQueues::default(),
            next_snapshot_index: 0,
            recent: None,
        }
    }

    pub fn options(&self) -> &SnapshotOptions {
        &self.options
    }
}
