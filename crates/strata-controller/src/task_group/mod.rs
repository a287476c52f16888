mod core;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};

use crate::id::{NodeId, TaskIndex};
use crate::resources::JobResources;

/// Where a pending task currently waits within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidacy {
    /// Pending, but not yet admitted to the candidate index.
    AwaitingCandidacy,
    Candidate { min_memory: u64 },
    Delayed { deadline: DateTime<Utc> },
}

impl Candidacy {
    pub fn status(&self) -> &'static str {
        match self {
            Candidacy::AwaitingCandidacy => "AWAITING_CANDIDACY",
            Candidacy::Candidate { .. } => "CANDIDATE",
            Candidacy::Delayed { .. } => "DELAYED",
        }
    }
}

/// The scheduling bucket of tasks sharing a coarse resource floor.
///
/// Every pending task of the group has exactly one [`Candidacy`], and the
/// non-local set, the candidate index and the delay queue are views of it.
/// Tasks without pending jobs have no candidacy at all.
/// The per-node locality index is maintained independently and may contain
/// stale entries that are evicted lazily when scanned.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    min_needed_resources: JobResources,
    candidacy: IndexMap<TaskIndex, Candidacy>,
    non_local: IndexSet<TaskIndex>,
    candidates: BTreeSet<(u64, TaskIndex)>,
    delayed: BTreeSet<(DateTime<Utc>, TaskIndex)>,
    node_tasks: HashMap<NodeId, IndexSet<TaskIndex>>,
}

impl TaskGroup {
    pub fn new(min_needed_resources: JobResources) -> Self {
        Self {
            min_needed_resources,
            candidacy: IndexMap::new(),
            non_local: IndexSet::new(),
            candidates: BTreeSet::new(),
            delayed: BTreeSet::new(),
            node_tasks: HashMap::new(),
        }
    }
}
