//! Error types for the middleware runtime.

use thiserror::Error;

use crate::abi::{BodyKind, HeaderKind};
use crate::trap::TrapPhase;

/// Errors surfaced to the embedder by the middleware.
#[derive(Debug, Error)]
pub enum MiddlewareError {
    /// Failed to create the WASM engine.
    #[error("failed to create WASM engine: {0}")]
    EngineCreation(String),

    /// Failed to compile the guest module.
    #[error("failed to compile guest module: {0}")]
    Compilation(String),

    /// Failed to instantiate the guest module.
    #[error("failed to instantiate guest module: {0}")]
    Instantiation(String),

    /// Missing required guest export.
    #[error("missing required guest export: {0}")]
    MissingExport(String),

    /// Guest export or import has the wrong signature.
    #[error("invalid signature for '{name}': expected {expected}, got {actual}")]
    InvalidExportSignature {
        name: String,
        expected: String,
        actual: String,
    },

    /// Guest imports a function the host does not provide.
    #[error("guest imports unknown function {module}::{name}")]
    UnknownImport { module: String, name: String },

    /// Invalid runtime settings.
    #[error("invalid runtime settings: {0}")]
    Config(String),

    /// The guest broke the ABI contract.
    #[error("guest programming error during {phase}: {fault}")]
    GuestFault { phase: TrapPhase, fault: GuestFault },

    /// WASM execution trapped.
    #[error("guest trapped during {phase} ({class}): {message}")]
    Trap {
        phase: TrapPhase,
        class: &'static str,
        message: String,
    },

    /// Guest exhausted its fuel budget.
    #[error("guest exceeded its execution budget during {0}")]
    Timeout(TrapPhase),

    /// The embedder's host implementation failed.
    #[error("host failure during {phase}: {source}")]
    Host {
        phase: TrapPhase,
        #[source]
        source: HostError,
    },

    /// The request was cancelled before the guest finished.
    #[error("request cancelled")]
    Cancelled,

    /// The middleware has been closed.
    #[error("middleware is closed")]
    Closed,

    /// A guest execution flow panicked.
    #[error("guest execution panicked: {0}")]
    Panicked(String),
}

impl MiddlewareError {
    /// Returns true for failures caused by the guest (fault or trap).
    ///
    /// Adapters typically answer these with a 500 and no body.
    pub fn is_guest_failure(&self) -> bool {
        matches!(
            self,
            MiddlewareError::GuestFault { .. }
                | MiddlewareError::Trap { .. }
                | MiddlewareError::Timeout(_)
        )
    }

    /// Returns true for initialisation failures.
    pub fn is_init_failure(&self) -> bool {
        matches!(
            self,
            MiddlewareError::EngineCreation(_)
                | MiddlewareError::Compilation(_)
                | MiddlewareError::Instantiation(_)
                | MiddlewareError::MissingExport(_)
                | MiddlewareError::InvalidExportSignature { .. }
                | MiddlewareError::UnknownImport { .. }
                | MiddlewareError::Config(_)
        )
    }
}

impl From<toml::de::Error> for MiddlewareError {
    fn from(err: toml::de::Error) -> Self {
        MiddlewareError::Config(err.to_string())
    }
}

/// A violation of the ABI contract by the guest.
///
/// Raised from inside host functions; the guest call traps and the
/// request fails. The instance is never reused after a fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestFault {
    #[error("header name is empty")]
    EmptyHeaderName,

    #[error("buffer limit is zero")]
    ZeroBufferLimit,

    #[error("memory access out of bounds: offset {offset}, length {len}, memory size {size}")]
    OutOfBounds { offset: u32, len: u32, size: usize },

    #[error("{what} is not valid UTF-8")]
    InvalidUtf8 { what: &'static str },

    #[error("unknown header kind {0}")]
    UnknownHeaderKind(u32),

    #[error("unknown body kind {0}")]
    UnknownBodyKind(u32),

    #[error("cannot {op} {target} after next")]
    AfterNext { op: &'static str, target: Target },

    #[error("{0} called outside a request")]
    OutsideRequest(&'static str),

    #[error("await_response called more than once")]
    AwaitTwice,

    #[error("guest does not export memory")]
    MissingMemory,
}

/// The piece of request or response state an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Method,
    Uri,
    StatusCode,
    Header(HeaderKind),
    Body(BodyKind),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Method => f.write_str("method"),
            Target::Uri => f.write_str("uri"),
            Target::StatusCode => f.write_str("status code"),
            Target::Header(kind) => write!(f, "{kind}"),
            Target::Body(kind) => write!(f, "{kind}"),
        }
    }
}

/// Errors returned by an embedder's [`Host`](crate::Host) implementation.
#[derive(Debug, Error)]
pub enum HostError {
    /// Body stream I/O failed.
    #[error("body I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host does not support this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The guest supplied a value the host cannot accept.
    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },

    /// The upstream handler failed.
    #[error("upstream failed: {0}")]
    Upstream(String),
}

/// Rendezvous failure in the one-shot strategy; the guest is aborted.
#[derive(Debug, Clone, Copy, Error)]
#[error("guest execution aborted")]
pub(crate) struct Aborted;
