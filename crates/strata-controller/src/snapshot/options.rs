//! A dedicated module for snapshot options to ensure readonly access.

use std::time::Duration;

use crate::controller::ControllerOptions;

#[readonly::make]
pub struct SnapshotOptions {
    pub snapshot_period: Duration,
    pub snapshot_timeout: Duration,
    pub enable_job_revival: bool,
    pub fail_on_job_restart: bool,
}

impl From<&ControllerOptions> for SnapshotOptions {
    fn from(options: &ControllerOptions) -> Self {
        Self {
            snapshot_period: options.snapshot_period,
            snapshot_timeout: options.snapshot_timeout,
            enable_job_revival: options.enable_job_revival,
            fail_on_job_restart: options.fail_on_job_restart,
        }
    }
}
