mod core;
mod options;
mod state;

use std::sync::Arc;

pub use options::ChunkTrackerOptions;
pub use state::{
    ChunkStripeDescriptor, ChunkTrackerState, CompletedJobRecord, InputChunkDescriptor,
    InputChunkState,
};

use crate::host::ChunkProber;
use crate::scheduler::Scheduler;
use crate::snapshot::SnapshotCoordinator;
use crate::task::TaskTable;

/// Tracks which input and intermediate chunks can be read, and suspends or
/// resumes the stripes that depend on them.
pub struct ChunkAvailabilityTracker {
    options: ChunkTrackerOptions,
    state: ChunkTrackerState,
    input_prober: Arc<dyn ChunkProber>,
    input_prober_running: bool,
    intermediate_prober: Arc<dyn ChunkProber>,
    intermediate_prober_running: bool,
}

impl ChunkAvailabilityTracker {
    pub fn new(
        options: ChunkTrackerOptions,
        input_prober: Arc<dyn ChunkProber>,
        intermediate_prober: Arc<dyn ChunkProber>,
    ) -> Self {
        Self {
            options,
            state: ChunkTrackerState::default(),
            input_prober,
            input_prober_running: false,
            intermediate_prober,
            intermediate_prober_running: false,
        }
    }
}

/// The controller state touched by chunk availability transitions.
pub struct TrackerContext<'a> {
    pub tasks: &'a mut TaskTable,
    pub scheduler: &'a mut Scheduler,
    pub snapshots: &'a mut SnapshotCoordinator,
}

/// The outcome of registering an input chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRegistration {
    Included,
    /// The chunk is unavailable and must not be added to any stripe.
    Skipped,
}
