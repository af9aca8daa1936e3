//! The contract an embedder implements to expose one HTTP exchange to a guest.
//!
//! A `Host` value represents a single in-flight request and its response.
//! Framework adapters wrap their native request/response types in one and
//! pass it to [`Middleware::handle_request`](crate::Middleware::handle_request).
//! Guest calls may arrive from a blocking worker thread, so implementations
//! use interior mutability and must be `Send + Sync`.

use std::io::{Read, Write};

use crate::abi::{BodyKind, Features, HeaderKind, LogLevel};
use crate::error::HostError;

/// Readable body stream handed out by [`Host::body_reader`].
pub type BodyReader = Box<dyn Read + Send>;

/// Writable body stream handed out by [`Host::body_writer`].
pub type BodyWriter = Box<dyn Write + Send>;

/// Accessors over one HTTP exchange.
///
/// Header lookups by name must be case-insensitive. Header names returned
/// from [`Host::header_names`] may use any case; the bridge lowercases them.
pub trait Host: Send + Sync {
    /// Enable `features` for this request and return the effective set.
    ///
    /// Implementations may refuse features they cannot honour; the returned
    /// value is authoritative.
    fn enable_features(&self, features: Features) -> Features;

    fn method(&self) -> String;

    fn set_method(&self, method: &str) -> Result<(), HostError>;

    /// Path and query, e.g. `/v1.0/hi?name=panda`.
    fn uri(&self) -> String;

    fn set_uri(&self, uri: &str) -> Result<(), HostError>;

    /// e.g. `HTTP/1.1`. Never empty.
    fn protocol_version(&self) -> String;

    fn remote_addr(&self) -> String;

    fn header_names(&self, kind: HeaderKind) -> Vec<String>;

    /// All values for `name`, in insertion order.
    fn header_values(&self, kind: HeaderKind, name: &str) -> Vec<String>;

    /// Replace all values of `name` with `value`.
    fn set_header_value(&self, kind: HeaderKind, name: &str, value: &str)
        -> Result<(), HostError>;

    fn add_header_value(&self, kind: HeaderKind, name: &str, value: &str)
        -> Result<(), HostError>;

    fn remove_header(&self, kind: HeaderKind, name: &str) -> Result<(), HostError>;

    /// Open the body for reading. Called at most once per body per request.
    fn body_reader(&self, kind: BodyKind) -> Result<BodyReader, HostError>;

    /// Open the body for writing. Opening truncates the existing body.
    ///
    /// Called at most once per body per request. The writer is flushed when
    /// the request state closes.
    fn body_writer(&self, kind: BodyKind) -> Result<BodyWriter, HostError>;

    fn status_code(&self) -> u32;

    fn set_status_code(&self, code: u32) -> Result<(), HostError>;

    /// Run the upstream handler to completion.
    ///
    /// Only [`Middleware::handle`](crate::Middleware::handle) calls this;
    /// adapters driving the two phases themselves can leave the default.
    fn next(&self) -> Result<(), HostError> {
        Err(HostError::Unsupported("next"))
    }
}

/// Destination for guest log messages.
pub trait Logger: Send + Sync {
    fn is_enabled(&self, level: LogLevel) -> bool;

    fn log(&self, level: LogLevel, message: &str);
}

/// Target used for guest log records.
pub const GUEST_LOG_TARGET: &str = "httpwasm::guest";

/// Forwards guest logs to `tracing` under [`GUEST_LOG_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn is_enabled(&self, level: LogLevel) -> bool {
        match level {
            LogLevel::Debug => tracing::enabled!(target: GUEST_LOG_TARGET, tracing::Level::DEBUG),
            LogLevel::Info => tracing::enabled!(target: GUEST_LOG_TARGET, tracing::Level::INFO),
            LogLevel::Warn => tracing::enabled!(target: GUEST_LOG_TARGET, tracing::Level::WARN),
            LogLevel::Error => tracing::enabled!(target: GUEST_LOG_TARGET, tracing::Level::ERROR),
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: GUEST_LOG_TARGET, "{}", message),
            LogLevel::Info => tracing::info!(target: GUEST_LOG_TARGET, "{}", message),
            LogLevel::Warn => tracing::warn!(target: GUEST_LOG_TARGET, "{}", message),
            LogLevel::Error => tracing::error!(target: GUEST_LOG_TARGET, "{}", message),
        }
    }
}

/// Discards all guest logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopLogger;

impl Logger for NopLogger {
    fn is_enabled(&self, _level: LogLevel) -> bool {
        false
    }

    fn log(&self, _level: LogLevel, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_logger_is_never_enabled() {
        let logger = NopLogger;
        assert!(!logger.is_enabled(LogLevel::Error));
        logger.log(LogLevel::Error, "dropped");
    }
}
