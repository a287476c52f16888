//! A dedicated module for job lifecycle options to ensure readonly access.

use std::time::Duration;

use strata_common::config::JobSplittingConfig;

use crate::controller::ControllerOptions;

#[readonly::make]
pub struct LifecycleOptions {
    pub max_failed_job_count: usize,
    pub fail_on_job_restart: bool,
    pub ignore_job_failures_at_banned_nodes: bool,
    pub ban_nodes_with_failed_jobs: bool,
    pub resource_overdraft_factor: f64,
    pub suspicious_inactivity_timeout: Duration,
    pub max_job_nodes_per_operation: usize,
    pub max_stderr_count: usize,
    pub job_splitting: JobSplittingConfig,
}

impl From<&ControllerOptions> for LifecycleOptions {
    fn from(options: &ControllerOptions) -> Self {
        Self {
            max_failed_job_count: options.max_failed_job_count,
            fail_on_job_restart: options.fail_on_job_restart,
            ignore_job_failures_at_banned_nodes: options.ignore_job_failures_at_banned_nodes,
            ban_nodes_with_failed_jobs: options.ban_nodes_with_failed_jobs,
            resource_overdraft_factor: options.resource_overdraft_factor,
            suspicious_inactivity_timeout: options.suspicious_inactivity_timeout,
            max_job_nodes_per_operation: options.max_job_nodes_per_operation,
            max_stderr_count: options.max_stderr_count,
            job_splitting: options.job_splitting.clone(),
        }
    }
}
