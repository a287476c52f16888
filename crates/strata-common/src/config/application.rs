use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

const MAX_FAILED_JOB_COUNT_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub operation: OperationConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        Self::extract(Figment::from(Toml::string(DEFAULT_CONFIG)))
    }

    /// Loads the configuration with an extra TOML document layered
    /// between the defaults and the environment.
    pub fn load_with_overrides(overrides: &str) -> CommonResult<Self> {
        Self::extract(Figment::from(Toml::string(DEFAULT_CONFIG)).admerge(Toml::string(overrides)))
    }

    fn extract(figment: Figment) -> CommonResult<Self> {
        let config: Self = figment
            .admerge(Env::prefixed("STRATA__").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> CommonResult<()> {
        if self.operation.max_failed_job_count > MAX_FAILED_JOB_COUNT_LIMIT {
            return Err(CommonError::invalid(format!(
                "max failed job count must not exceed {MAX_FAILED_JOB_COUNT_LIMIT}"
            )));
        }
        if !(1.0..=10.0).contains(&self.controller.resource_overdraft_factor) {
            return Err(CommonError::invalid(
                "resource overdraft factor must be within [1, 10]",
            ));
        }
        for quantile in [
            self.controller.user_job_memory_reserve_quantile,
            self.controller.job_proxy_memory_reserve_quantile,
        ] {
            if !(0.0..=1.0).contains(&quantile) {
                return Err(CommonError::invalid(
                    "memory reserve quantile must be within [0, 1]",
                ));
            }
        }
        if self.controller.user_job_memory_digest_precision <= 0.0 {
            return Err(CommonError::invalid(
                "memory digest precision must be positive",
            ));
        }
        self.operation.user_job_memory_digest.validate()?;
        self.operation.job_proxy_memory_digest.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub snapshot_period_secs: u64,
    pub snapshot_timeout_secs: u64,
    pub enable_job_revival: bool,
    pub resource_overdraft_factor: f64,
    pub user_job_memory_reserve_quantile: f64,
    pub job_proxy_memory_reserve_quantile: f64,
    pub user_job_memory_digest_precision: f64,
    pub chunk_scraper_max_chunks_per_request: usize,
    pub suspicious_inactivity_timeout_secs: u64,
    pub suspicious_check_period_secs: u64,
    /// The number of spare chunk lists kept for each output cell.
    pub chunk_list_watermark: usize,
    pub max_job_nodes_per_operation: usize,
    pub max_stderr_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    pub max_failed_job_count: usize,
    pub unavailable_chunk_tactics: UnavailableChunkTactics,
    pub fail_on_job_restart: bool,
    pub ignore_job_failures_at_banned_nodes: bool,
    pub ban_nodes_with_failed_jobs: bool,
    pub check_parity_replicas: bool,
    pub enable_locality: bool,
    pub locality_timeout_secs: u64,
    pub user_job_memory_digest: LogDigestConfig,
    pub job_proxy_memory_digest: LogDigestConfig,
    pub job_splitting: JobSplittingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnavailableChunkTactics {
    Fail,
    Skip,
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDigestConfig {
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub default_value: f64,
}

impl LogDigestConfig {
    fn validate(&self) -> CommonResult<()> {
        if self.lower_bound <= 0.0 || self.lower_bound > self.upper_bound {
            return Err(CommonError::invalid(format!(
                "invalid digest bounds [{}, {}]",
                self.lower_bound, self.upper_bound
            )));
        }
        if !(self.lower_bound..=self.upper_bound).contains(&self.default_value) {
            return Err(CommonError::invalid(format!(
                "digest default value {} is out of bounds",
                self.default_value
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSplittingConfig {
    pub enabled: bool,
    pub min_completed_jobs: usize,
    pub split_duration_ratio: f64,
    pub speculative_duration_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_filter: String,
}
