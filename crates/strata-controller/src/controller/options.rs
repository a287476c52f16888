//! A dedicated module for controller options to ensure readonly access.

use std::sync::Arc;
use std::time::Duration;

use strata_common::config::{AppConfig, JobSplittingConfig, LogDigestConfig, UnavailableChunkTactics};

use crate::host::{ChunkProber, ControllerHost, JobSpecBuilder, SnapshotStorage};
use crate::metrics::{ControllerMetrics, ProgressCounters};
use crate::task::{LogDigest, MemoryReserve};

/// The collaborators the embedding service provides to the controller.
pub struct ControllerServices {
    pub host: Arc<dyn ControllerHost>,
    pub input_prober: Arc<dyn ChunkProber>,
    pub intermediate_prober: Arc<dyn ChunkProber>,
    pub snapshot_storage: Arc<dyn SnapshotStorage>,
    pub job_spec_builder: Arc<dyn JobSpecBuilder>,
    pub metrics: Arc<ControllerMetrics>,
    pub progress: Arc<ProgressCounters>,
}

#[readonly::make]
pub struct ControllerOptions {
    pub snapshot_period: Duration,
    pub snapshot_timeout: Duration,
    pub enable_job_revival: bool,
    pub resource_overdraft_factor: f64,
    pub user_job_memory_reserve_quantile: f64,
    pub job_proxy_memory_reserve_quantile: f64,
    pub user_job_memory_digest_precision: f64,
    pub chunk_scraper_max_chunks_per_request: usize,
    pub suspicious_inactivity_timeout: Duration,
    pub suspicious_check_period: Duration,
    pub chunk_list_watermark: usize,
    pub max_job_nodes_per_operation: usize,
    pub max_stderr_count: usize,
    pub max_failed_job_count: usize,
    pub unavailable_chunk_tactics: UnavailableChunkTactics,
    pub fail_on_job_restart: bool,
    pub ignore_job_failures_at_banned_nodes: bool,
    pub ban_nodes_with_failed_jobs: bool,
    pub check_parity_replicas: bool,
    pub enable_locality: bool,
    pub locality_timeout: Duration,
    pub user_job_memory_digest: LogDigestConfig,
    pub job_proxy_memory_digest: LogDigestConfig,
    pub job_splitting: JobSplittingConfig,
    pub host: Arc<dyn ControllerHost>,
    pub input_prober: Arc<dyn ChunkProber>,
    pub intermediate_prober: Arc<dyn ChunkProber>,
    pub snapshot_storage: Arc<dyn SnapshotStorage>,
    pub job_spec_builder: Arc<dyn JobSpecBuilder>,
    pub metrics: Arc<ControllerMetrics>,
    pub progress: Arc<ProgressCounters>,
}

impl ControllerOptions {
    pub fn new(config: &AppConfig, services: ControllerServices) -> Self {
        Self {
            snapshot_period: Duration::from_secs(config.controller.snapshot_period_secs),
            snapshot_timeout: Duration::from_secs(config.controller.snapshot_timeout_secs),
            enable_job_revival: config.controller.enable_job_revival,
            resource_overdraft_factor: config.controller.resource_overdraft_factor,
            user_job_memory_reserve_quantile: config.controller.user_job_memory_reserve_quantile,
            job_proxy_memory_reserve_quantile: config.controller.job_proxy_memory_reserve_quantile,
            user_job_memory_digest_precision: config.controller.user_job_memory_digest_precision,
            chunk_scraper_max_chunks_per_request: config
                .controller
                .chunk_scraper_max_chunks_per_request,
            suspicious_inactivity_timeout: Duration::from_secs(
                config.controller.suspicious_inactivity_timeout_secs,
            ),
            suspicious_check_period: Duration::from_secs(
                config.controller.suspicious_check_period_secs,
            ),
            chunk_list_watermark: config.controller.chunk_list_watermark,
            max_job_nodes_per_operation: config.controller.max_job_nodes_per_operation,
            max_stderr_count: config.controller.max_stderr_count,
            max_failed_job_count: config.operation.max_failed_job_count,
            unavailable_chunk_tactics: config.operation.unavailable_chunk_tactics,
            fail_on_job_restart: config.operation.fail_on_job_restart,
            ignore_job_failures_at_banned_nodes: config
                .operation
                .ignore_job_failures_at_banned_nodes,
            ban_nodes_with_failed_jobs: config.operation.ban_nodes_with_failed_jobs,
            check_parity_replicas: config.operation.check_parity_replicas,
            enable_locality: config.operation.enable_locality,
            locality_timeout: Duration::from_secs(config.operation.locality_timeout_secs),
            user_job_memory_digest: config.operation.user_job_memory_digest.clone(),
            job_proxy_memory_digest: config.operation.job_proxy_memory_digest.clone(),
            job_splitting: config.operation.job_splitting.clone(),
            host: services.host,
            input_prober: services.input_prober,
            intermediate_prober: services.intermediate_prober,
            snapshot_storage: services.snapshot_storage,
            job_spec_builder: services.job_spec_builder,
            metrics: services.metrics,
            progress: services.progress,
        }
    }

    pub fn memory_reserve(&self) -> MemoryReserve {
        MemoryReserve {
            user_job_quantile: self.user_job_memory_reserve_quantile,
            job_proxy_quantile: self.job_proxy_memory_reserve_quantile,
        }
    }

    pub fn initial_user_job_digest(&self) -> LogDigest {
        digest(&self.user_job_memory_digest, self.user_job_memory_digest_precision)
    }

    pub fn initial_job_proxy_digest(&self) -> LogDigest {
        digest(&self.job_proxy_memory_digest, self.user_job_memory_digest_precision)
    }
}

fn digest(config: &LogDigestConfig, precision: f64) -> LogDigest {
    LogDigest::new(
        config.lower_bound,
        config.upper_bound,
        config.default_value,
        precision,
    )
}
