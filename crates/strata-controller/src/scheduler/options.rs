//! A dedicated module for scheduler options to ensure readonly access.

use crate::controller::ControllerOptions;

#[readonly::make]
pub struct SchedulerOptions {
    pub enable_locality: bool,
    /// The number of spare chunk lists to keep for each output cell.
    pub chunk_list_watermark: usize,
}

impl From<&ControllerOptions> for SchedulerOptions {
    fn from(options: &ControllerOptions) -> Self {
        Self {
            enable_locality: options.enable_locality,
            chunk_list_watermark: options.chunk_list_watermark,
        }
    }
}
