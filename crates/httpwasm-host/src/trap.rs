//! Guest trap handling.
//!
//! Every failure inside a guest call is fatal for the request: the embedder
//! answers with a 500-class response and the instance is never reused.
//! This module maps raw wasmtime errors back to the typed cause raised by
//! the host function, if any.

use std::fmt;

use wasmtime::Trap;

use crate::error::{Aborted, GuestFault, HostError, MiddlewareError};

/// The phase in which a guest call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapPhase {
    /// Instance start functions.
    Init,
    /// `handle_request`.
    Request,
    /// `handle_response`, or the one-shot guest after `await_response`.
    Response,
}

impl TrapPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TrapPhase::Init => "init",
            TrapPhase::Request => "request",
            TrapPhase::Response => "response",
        }
    }
}

impl fmt::Display for TrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a wasmtime trap into a human-readable category.
pub fn classify_trap(trap: &Trap) -> &'static str {
    match trap {
        Trap::OutOfFuel => "execution timeout",
        Trap::UnreachableCodeReached => "unreachable code executed (likely panic)",
        Trap::MemoryOutOfBounds | Trap::HeapMisaligned => "memory access error",
        Trap::StackOverflow => "stack overflow",
        Trap::IndirectCallToNull | Trap::BadSignature | Trap::TableOutOfBounds => {
            "invalid indirect call"
        }
        Trap::IntegerOverflow | Trap::IntegerDivisionByZero | Trap::BadConversionToInteger => {
            "integer overflow or division error"
        }
        _ => "unknown trap",
    }
}

/// Convert the error of a guest call into a [`MiddlewareError`].
pub(crate) fn guest_error(err: wasmtime::Error, phase: TrapPhase) -> MiddlewareError {
    if let Some(fault) = err.downcast_ref::<GuestFault>() {
        return MiddlewareError::GuestFault {
            phase,
            fault: fault.clone(),
        };
    }
    if err.downcast_ref::<Aborted>().is_some() {
        return MiddlewareError::Cancelled;
    }
    let err = match err.downcast::<HostError>() {
        Ok(source) => return MiddlewareError::Host { phase, source },
        Err(err) => err,
    };
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => MiddlewareError::Timeout(phase),
        Some(trap) => MiddlewareError::Trap {
            phase,
            class: classify_trap(trap),
            message: format!("{err:?}"),
        },
        None => MiddlewareError::Trap {
            phase,
            class: "host error",
            message: format!("{err:#}"),
        },
    }
}

/// The label used for a failure in logs and metrics.
pub(crate) fn failure_class(err: &MiddlewareError) -> &'static str {
    match err {
        MiddlewareError::GuestFault { .. } => "guest fault",
        MiddlewareError::Trap { class, .. } => class,
        MiddlewareError::Timeout(_) => "execution timeout",
        MiddlewareError::Host { .. } => "host failure",
        MiddlewareError::Cancelled => "cancelled",
        _ => "other",
    }
}
