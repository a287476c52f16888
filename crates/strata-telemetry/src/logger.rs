use std::io::Write;
use std::sync::Mutex;

use log::debug;
use strata_common::config::TelemetryConfig;

use crate::error::{TelemetryError, TelemetryResult};

enum LoggerStatus {
    Uninitialized,
    Initialized,
    Failed,
}

static LOGGER_STATUS: Mutex<LoggerStatus> = Mutex::new(LoggerStatus::Uninitialized);

/// Installs the process-wide logger.
///
/// The filter from the configuration is used unless `RUST_LOG` is set.
pub fn init_logger(config: &TelemetryConfig) -> TelemetryResult<()> {
    let mut status = LOGGER_STATUS
        .lock()
        .map_err(|e| TelemetryError::internal(e.to_string()))?;

    match *status {
        LoggerStatus::Uninitialized => {
            if config.log_filter.trim().is_empty() {
                return Err(TelemetryError::invalid("empty log filter"));
            }
            let result = env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or(config.log_filter.as_str()),
            )
            .format(move |buf, record| {
                let level = record.level();
                let target = record.target();
                let style = buf.default_level_style(level);
                let timestamp = buf.timestamp();
                let args = record.args();
                writeln!(buf, "[{timestamp} {style}{level}{style:#} {target}] {args}")
            })
            .try_init();
            match result {
                Ok(()) => {
                    debug!("logger initialized");
                    *status = LoggerStatus::Initialized;
                    Ok(())
                }
                Err(e) => {
                    *status = LoggerStatus::Failed;
                    Err(TelemetryError::internal(e.to_string()))
                }
            }
        }
        LoggerStatus::Initialized => Err(TelemetryError::internal("logger already initialized")),
        LoggerStatus::Failed => Err(TelemetryError::internal(
            "logger failed to initialize previously",
        )),
    }
}
