use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const USER_JOB_MAX_MEMORY: &str = "/user_job/max_memory";
pub const JOB_PROXY_MAX_MEMORY: &str = "/job_proxy/max_memory";
pub const DATA_INPUT_ROW_COUNT: &str = "/data/input/row_count";

/// Job statistics keyed by slash-separated paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatistics(BTreeMap<String, i64>);

impl JobStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, value: i64) -> Self {
        self.0.insert(path.into(), value);
        self
    }

    pub fn get(&self, path: &str) -> Option<i64> {
        self.0.get(path).copied()
    }

    pub fn set(&mut self, path: impl Into<String>, value: i64) {
        self.0.insert(path.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds every value of `other` into the aggregate.
    pub fn merge(&mut self, other: &JobStatistics) {
        for (path, value) in other.0.iter() {
            let entry = self.0.entry(path.clone()).or_insert(0);
            *entry = entry.saturating_add(*value);
        }
    }
}
