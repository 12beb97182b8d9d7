//! Structured logging for the cluster client and reference node
//!
//! This module provides structured logging using the `tracing` crate with
//! support for console output and an optional rolling log file.

use crate::config::{LogFormat, LogLevel, LogRotationInterval, LoggingConfig};
use std::path::Path;
use std::sync::{Once, OnceLock};
use std::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

static INIT: Once = Once::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the logging system based on configuration.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(config);
    });
    result
}

fn init_logging_inner(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let level = convert_log_level(config.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.console {
        layers.push(format_layer(config.format, std::io::stdout));
    }

    if let Some(file_path) = &config.file_path {
        let (writer, guard) = create_file_writer(file_path, config.rotation)?;
        let _ = FILE_GUARD.set(guard);
        layers.push(format_layer(config.format, writer));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    tracing::info!("Logging system initialized with level: {:?}", config.level);
    Ok(())
}

fn format_layer<W>(format: LogFormat, writer: W) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339());

    match format {
        LogFormat::Simple => base.boxed(),
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    }
}

fn create_file_writer(
    file_path: &str,
    rotation: LogRotationInterval,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), Box<dyn std::error::Error>> {
    let path = Path::new(file_path);
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("Log file path has no file name: {}", file_path))?;

    let appender = match rotation {
        LogRotationInterval::Daily => tracing_appender::rolling::daily(directory, file_name),
        LogRotationInterval::Hourly => tracing_appender::rolling::hourly(directory, file_name),
        LogRotationInterval::Never => tracing_appender::rolling::never(directory, file_name),
    };
    Ok(tracing_appender::non_blocking(appender))
}

/// Convert our log level to tracing level
fn convert_log_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

/// Log one client round trip with structured fields
pub fn log_client_operation(
    operation: &str,
    node: &str,
    success: bool,
    duration: Duration,
    error_kind: Option<&str>,
) {
    let span = tracing::info_span!(
        "client_operation",
        operation = operation,
        node = node,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    match error_kind {
        None => tracing::debug!("Cluster operation completed successfully"),
        Some(kind) => tracing::warn!(error_kind = kind, "Cluster operation failed"),
    }
}

/// Log one request handled by a node
pub fn log_node_request(operation: &str, status: u16, duration: Duration) {
    tracing::info!(
        operation = operation,
        status = status,
        duration_ms = duration.as_millis() as u64,
        "Node request handled"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(convert_log_level(LogLevel::Warn), Level::WARN);
        assert_eq!(convert_log_level(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            console: false,
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
        log_client_operation("READ", "127.0.0.1:8000", true, Duration::from_millis(3), None);
    }

    #[test]
    fn test_file_writer_rejects_directory_only_path() {
        assert!(create_file_writer("/", LogRotationInterval::Never).is_err());
    }
}
