mod core;
mod event;
mod handler;
mod options;
mod revive;
mod state;

use std::collections::HashSet;

pub use event::{ControllerEvent, OperationPlan, TaskSpec};
pub use options::{ControllerOptions, ControllerServices};
pub use state::OperationState;

use crate::chunk_tracker::ChunkAvailabilityTracker;
use crate::id::{NodeId, TransactionId};
use crate::lifecycle::JobLifecycleManager;
use crate::scheduler::Scheduler;
use crate::snapshot::SnapshotCoordinator;
use crate::task::TaskTable;

/// The serialized execution context of one operation.
/// Every subsystem is mutated only from within the actor.
pub struct ControllerActor {
    options: ControllerOptions,
    state: OperationState,
    tasks: TaskTable,
    scheduler: Scheduler,
    chunk_tracker: ChunkAvailabilityTracker,
    lifecycle: JobLifecycleManager,
    snapshots: SnapshotCoordinator,
    transactions: Vec<TransactionId>,
    known_nodes: HashSet<NodeId>,
}
