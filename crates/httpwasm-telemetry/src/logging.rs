//! Structured logging with JSON or pretty output.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging subsystem.
///
/// Sets up tracing-subscriber with either JSON or pretty format. `RUST_LOG`
/// overrides the configured level when set.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => init_json_logging(filter),
        LogFormat::Pretty => init_pretty_logging(filter),
    }
}

fn init_json_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let json_layer = fmt::layer()
        .json()
        .with_target(true)
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

fn init_pretty_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let pretty_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
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
    /// Telemetry is up.
    pub const STARTUP: &str = "startup";

    /// A guest module compiled and passed validation.
    pub const GUEST_COMPILED: &str = "guest_compiled";

    /// A guest instance was created and its start function ran.
    pub const INSTANCE_CREATED: &str = "instance_created";

    /// A pooled instance was dropped instead of reused.
    pub const INSTANCE_DISCARDED: &str = "instance_discarded";

    /// A guest call trapped or faulted.
    pub const GUEST_TRAP: &str = "guest_trap";

    /// A request was cancelled while the guest was in flight.
    pub const REQUEST_CANCELLED: &str = "request_cancelled";

    /// A middleware was closed.
    pub const MIDDLEWARE_CLOSED: &str = "middleware_closed";
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
macro_rules! log_guest_compiled {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::GUEST_COMPILED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_instance_created {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::INSTANCE_CREATED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_instance_discarded {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::INSTANCE_DISCARDED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_guest_trap {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::GUEST_TRAP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_request_cancelled {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::REQUEST_CANCELLED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_middleware_closed {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::MIDDLEWARE_CLOSED,
            $($field)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // Logging initialization is process-global, so only the
    // configuration logic is tested here.

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("invalid"), None);
    }

    #[test]
    fn test_event_names_are_snake_case() {
        for name in [
            events::GUEST_COMPILED,
            events::INSTANCE_CREATED,
            events::INSTANCE_DISCARDED,
            events::GUEST_TRAP,
            events::REQUEST_CANCELLED,
        ] {
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
