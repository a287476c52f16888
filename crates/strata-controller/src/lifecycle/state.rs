use serde::{Deserialize, Serialize};

use crate::lifecycle::Joblet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    pub aborted: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleState {
    pub joblets: Vec<Joblet>,
    pub counters: JobCounters,
    pub job_node_count: usize,
    pub stderr_count: usize,
}
