//! Logging for ModelHub
//!
//! Installs the process-wide `tracing` subscriber. Library crates only emit
//! events through the `tracing` macros and never depend on this crate.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use common::error::{Error, Result};
use hub_config::LoggingSettings;

/// Prefix of the rolling log files
pub const LOG_FILE_PREFIX: &str = "modelhub.log";

/// Builds the filter: `RUST_LOG` wins over the configured level
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.level)
            .map_err(|e| Error::Config(format!("invalid log level '{}': {}", settings.level, e))),
    }
}

/// Initializes logging.
///
/// When a log directory is configured the returned guard must be kept alive
/// for buffered lines to be flushed.
pub fn init(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(settings)?;

    let (writer, guard) = match &settings.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(writer);

    let result = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| Error::Config(format!("failed to install log subscriber: {}", e)))?;

    Ok(guard)
}
