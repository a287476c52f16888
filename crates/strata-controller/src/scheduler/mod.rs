mod chunk_list;
mod core;
mod options;
mod state;

use indexmap::IndexSet;
pub use chunk_list::ChunkListPool;
pub use options::SchedulerOptions;
pub use state::{
    JobStartDescriptor, ScheduleFailReason, ScheduleOutcome, ScheduleResult, SchedulerState,
};

use crate::id::{IdGenerator, JobId, NodeId, TaskGroupIndex};
use crate::resources::JobResources;
use crate::task::TaskTable;
use crate::task_group::TaskGroup;

/// Matches resource offers against the pending tasks of the operation.
pub struct Scheduler {
    options: SchedulerOptions,
    groups: Vec<TaskGroup>,
    /// Whether pending tasks are admitted as non-local candidates right away.
    active: bool,
    banned_nodes: IndexSet<NodeId>,
    job_ids: IdGenerator<JobId>,
    chunk_lists: ChunkListPool,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, tasks: &TaskTable) -> Self {
        let group_count = tasks
            .iter()
            .map(|x| x.group().index() + 1)
            .max()
            .unwrap_or(0);
        let mut minimums: Vec<Option<JobResources>> = vec![None; group_count];
        let mut chunk_lists = ChunkListPool::default();
        for task in tasks.iter() {
            let min = task.min_needed_resources();
            let entry = &mut minimums[task.group().index()];
            let merged = match entry {
                Some(x) => x.component_min(&min),
                None => min,
            };
            *entry = Some(merged);
            for cell in task.output_cells() {
                chunk_lists.register_cell(*cell);
            }
        }
        let groups = minimums
            .into_iter()
            .map(|x| TaskGroup::new(x.unwrap_or_default()))
            .collect();
        Self {
            options,
            groups,
            active: false,
            banned_nodes: IndexSet::new(),
            job_ids: IdGenerator::new(),
            chunk_lists,
        }
    }

    pub fn group(&self, index: TaskGroupIndex) -> Option<&TaskGroup> {
        self.groups.get(index.index())
    }
}
