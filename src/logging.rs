//! Logging and observability
//!
//! Structured logging with:
//! - JSON, pretty or compact console output on stderr
//! - Optional daily-rolling log file
//! - Event macros for scan jobs, profiled hosts and RPC calls

use anyhow::{Context, Result};
use std::io;
use tracing::{info, Level};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::{config::LoggingConfig, error::ReconError};

/// Initialize logging with specific configuration.
///
/// The returned guard must stay alive for as long as the file writer is used.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = create_env_filter(&config.level)?;

    let console_layer = match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_target(false)
            .boxed(),
        _ => fmt::layer()
            .pretty()
            .with_writer(io::stderr)
            .with_target(false)
            .boxed(),
    };

    let (file_layer, guard) = match &config.file_path {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
            let directory = directory.unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .context("Log file path has no file name")?;
            let appender = rolling::daily(directory, file_name);
            let (writer, guard) = non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!("Logging system initialized with level: {}", config.level);
    Ok(guard)
}

/// Create environment filter from log level string
fn create_env_filter(level: &str) -> Result<EnvFilter> {
    let base_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => return Err(ReconError::config(format!("Invalid log level: {}", level)).into()),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(base_level.into())
        .from_env()
        .context("Failed to create environment filter")?
        .add_directive("hyper=info".parse()?)
        .add_directive("tower_http=info".parse()?);

    Ok(filter)
}

#[macro_export]
macro_rules! log_scan_job {
    ($job_id:expr, $target:expr, $status:expr) => {
        tracing::info!(
            scan_job_id = $job_id,
            target = %$target,
            status = %$status,
            event = "scan_job",
            "Scan job {} on {} is {}",
            $job_id,
            $target,
            $status
        );
    };
}

#[macro_export]
macro_rules! log_host_profiled {
    ($ip:expr, $device_type:expr, $open_ports:expr) => {
        tracing::info!(
            host = %$ip,
            device_type = %$device_type,
            open_ports = $open_ports,
            event = "host_profiled",
            "Profiled {} as {} with {} open ports",
            $ip,
            $device_type,
            $open_ports
        );
    };
}

#[macro_export]
macro_rules! log_rpc_call {
    ($method:expr, $duration:expr) => {
        tracing::debug!(
            method = $method,
            duration_ms = $duration.as_millis() as u64,
            event = "rpc_call",
            "RPC {} answered in {}ms",
            $method,
            $duration.as_millis()
        );
    };
}

#[macro_export]
macro_rules! log_error_with_context {
    ($error:expr, $context:expr) => {
        tracing::error!(
            error = %$error,
            context = $context,
            severity = %$error.severity(),
            recoverable = $error.is_recoverable(),
            event = "error",
            "Error in {}: {}",
            $context,
            $error
        );
    };
}

/// Logs the elapsed time of an operation when dropped
pub struct TimingLogger {
    name: String,
    start_time: std::time::Instant,
}

impl TimingLogger {
    pub fn start<S: Into<String>>(name: S) -> Self {
        let name = name.into();
        tracing::trace!(operation = %name, event = "timing_start", "Starting timing for: {}", name);

        Self {
            name,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn checkpoint(&self, checkpoint_name: &str) {
        let elapsed = self.start_time.elapsed();
        tracing::debug!(
            operation = %self.name,
            checkpoint = checkpoint_name,
            elapsed_ms = elapsed.as_millis() as u64,
            event = "timing_checkpoint",
            "Checkpoint '{}' in '{}': {}ms",
            checkpoint_name,
            self.name,
            elapsed.as_millis()
        );
    }
}

impl Drop for TimingLogger {
    fn drop(&mut self) {
        let elapsed = self.start_time.elapsed();
        tracing::info!(
            operation = %self.name,
            duration_ms = elapsed.as_millis() as u64,
            event = "timing_complete",
            "Completed '{}' in {}ms",
            self.name,
            elapsed.as_millis()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_creation() {
        assert!(create_env_filter("info").is_ok());
        assert!(create_env_filter("DEBUG").is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        assert!(create_env_filter("invalid").is_err());
    }

    #[test]
    fn test_timing_logger_checkpoint() {
        let timer = TimingLogger::start("unit-test");
        timer.checkpoint("halfway");
    }
}
