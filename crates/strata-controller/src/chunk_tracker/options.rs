//! A dedicated module for chunk tracker options to ensure readonly access.

use strata_common::config::UnavailableChunkTactics;

use crate::controller::ControllerOptions;

#[readonly::make]
pub struct ChunkTrackerOptions {
    pub unavailable_chunk_tactics: UnavailableChunkTactics,
    pub check_parity_replicas: bool,
    pub max_chunks_per_request: usize,
}

impl From<&ControllerOptions> for ChunkTrackerOptions {
    fn from(options: &ControllerOptions) -> Self {
        Self {
            unavailable_chunk_tactics: options.unavailable_chunk_tactics,
            check_parity_replicas: options.check_parity_replicas,
            max_chunks_per_request: options.chunk_scraper_max_chunks_per_request,
        }
    }
}
