//! Structured logging with JSON or pretty output.
//!
//! Logs go to stdout, one event per line in JSON mode.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging subsystem.
///
/// Sets up tracing-subscriber with either JSON or pretty format,
/// respecting the configured log level unless `RUST_LOG` is set.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => init_json_logging(filter, config.with_target),
        LogFormat::Pretty => init_pretty_logging(filter, config.with_target),
    }
}

/// Initialize JSON logging for production.
fn init_json_logging(filter: EnvFilter, with_target: bool) -> Result<(), TelemetryError> {
    let json_layer = fmt::layer()
        .json()
        .with_target(with_target)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .flatten_event(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Initialize pretty logging for development.
fn init_pretty_logging(filter: EnvFilter, with_target: bool) -> Result<(), TelemetryError> {
    let pretty_layer = fmt::layer()
        .pretty()
        .with_target(with_target)
        .with_file(false)
        .with_line_number(false)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Standard log event names.
pub mod events {
    /// Process is starting up.
    pub const STARTUP: &str = "startup";

    /// Process is shutting down.
    pub const SHUTDOWN: &str = "shutdown";

    /// Server is listening on a port.
    pub const LISTENING: &str = "listening";

    /// Compiled artifact was published.
    pub const BUILD_COMPLETED: &str = "build_completed";

    /// Existing artifact was fresh.
    pub const CACHE_HIT: &str = "cache_hit";

    /// Artifact missing or stale.
    pub const CACHE_MISS: &str = "cache_miss";

    /// Source served without compilation.
    pub const PASSTHROUGH: &str = "passthrough";

    /// Session ended in an error.
    pub const SESSION_ERROR: &str = "session_error";

    /// Batch run finished.
    pub const BATCH_COMPLETED: &str = "batch_completed";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros to ensure consistent field naming.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_shutdown {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SHUTDOWN,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_listening {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LISTENING,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_build_completed {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::BUILD_COMPLETED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_cache_hit {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::CACHE_HIT,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_cache_miss {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::CACHE_MISS,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_passthrough {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::PASSTHROUGH,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_session_error {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::SESSION_ERROR,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_batch_completed {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::BATCH_COMPLETED,
            $($field)*
        )
    };
}
