use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use strata_common::config::JobSplittingConfig;

use crate::id::{JobId, TaskIndex};
use crate::lifecycle::Joblet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDecision {
    None,
    /// Interrupt the job so that its remaining input is split into new jobs.
    Split,
    LaunchSpeculative,
}

/// Decides whether a running job is slow enough to be split or duplicated.
pub trait JobSplitter: Send {
    fn on_job_running(
        &mut self,
        joblet: &Joblet,
        interruptible: bool,
        now: DateTime<Utc>,
    ) -> SplitDecision;
    fn on_job_completed(&mut self, joblet: &Joblet);
    fn on_job_finished(&mut self, job_id: JobId);
}

/// The number of most recent completed job durations kept per task.
const DURATION_WINDOW: usize = 64;

/// Compares the elapsed time of a running job with the median duration of
/// recently completed jobs of the same task.
pub struct DurationJobSplitter {
    config: JobSplittingConfig,
    durations: HashMap<TaskIndex, VecDeque<TimeDelta>>,
    /// Jobs that already received a decision.
    decided: HashSet<JobId>,
}

impl DurationJobSplitter {
    pub fn new(config: JobSplittingConfig) -> Self {
        Self {
            config,
            durations: HashMap::new(),
            decided: HashSet::new(),
        }
    }

    fn median_duration(&self, task: TaskIndex) -> Option<TimeDelta> {
        let durations = self.durations.get(&task)?;
        if durations.len() < self.config.min_completed_jobs.max(1) {
            return None;
        }
        let mut sorted = durations.iter().copied().collect::<Vec<_>>();
        sorted.sort_unstable();
        sorted.get(sorted.len() / 2).copied()
    }
}

impl JobSplitter for DurationJobSplitter {
    fn on_job_running(
        &mut self,
        joblet: &Joblet,
        interruptible: bool,
        now: DateTime<Utc>,
    ) -> SplitDecision {
        if !self.config.enabled || self.decided.contains(&joblet.job_id) || joblet.speculative {
            return SplitDecision::None;
        }
        let Some(median) = self.median_duration(joblet.task) else {
            return SplitDecision::None;
        };
        let Some(elapsed) = joblet.duration(now) else {
            return SplitDecision::None;
        };
        let median_ms = median.num_milliseconds().max(1) as f64;
        let ratio = elapsed.num_milliseconds() as f64 / median_ms;
        let decision = if interruptible && ratio >= self.config.split_duration_ratio {
            SplitDecision::Split
        } else if ratio >= self.config.speculative_duration_ratio {
            SplitDecision::LaunchSpeculative
        } else {
            SplitDecision::None
        };
        if decision != SplitDecision::None {
            debug!(
                "job {} runs {ratio:.1} times longer than the median, decision {decision:?}",
                joblet.job_id
            );
            self.decided.insert(joblet.job_id);
        }
        decision
    }

    fn on_job_completed(&mut self, joblet: &Joblet) {
        if let Some(duration) = joblet
            .start_time
            .zip(joblet.finish_time)
            .map(|(start, finish)| finish - start)
        {
            let durations = self.durations.entry(joblet.task).or_default();
            if durations.len() == DURATION_WINDOW {
                durations.pop_front();
            }
            durations.push_back(duration);
        }
        self.decided.remove(&joblet.job_id);
    }

    fn on_job_finished(&mut self, job_id: JobId) {
        self.decided.remove(&job_id);
    }
}
