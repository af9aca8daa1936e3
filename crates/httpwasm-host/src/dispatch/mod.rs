//! Dispatch core.
//!
//! The guest's call to next must appear to block until the upstream has
//! run, while guest functions are plain synchronous calls. Two strategies
//! provide that:
//!
//! - [`pooled`]: the guest exports `handle_request` and `handle_response`;
//!   the instance is pinned to the request between the two calls.
//! - [`one_shot`]: the guest runs once on a blocking thread and parks in
//!   `await_response` while the upstream runs.
//!
//! Guest execution always happens on tokio's blocking pool. Dropping a
//! request's future or its [`NextCall`] cancels it: pooled instances are
//! discarded and one-shot guests are aborted at their next rendezvous.

pub(crate) mod one_shot;
pub(crate) mod pooled;

use std::fmt;

use httpwasm_telemetry::{log_guest_trap, log_request_cancelled};
use tokio::task::JoinError;

use crate::error::MiddlewareError;
use crate::trap::failure_class;

/// Outcome of the request phase.
#[derive(Debug)]
pub enum Flow {
    /// The guest produced the response itself; do not call the upstream.
    Done,
    /// Run the upstream, then pass this to
    /// [`Middleware::handle_response`](crate::Middleware::handle_response).
    Next(NextCall),
}

impl Flow {
    pub fn is_next(&self) -> bool {
        matches!(self, Flow::Next(_))
    }
}

/// A request suspended across the upstream call.
///
/// Holds the guest instance (pooled) or the parked guest (one-shot).
/// Dropping it without resuming cancels the request.
#[must_use = "dropping a NextCall cancels the request"]
pub struct NextCall {
    ctx: u32,
    pending: Pending,
}

pub(crate) enum Pending {
    Pooled(pooled::Suspended),
    OneShot(one_shot::Suspended),
}

impl NextCall {
    pub(crate) fn new(ctx: u32, pending: Pending) -> Self {
        Self { ctx, pending }
    }

    /// The guest's opaque context handle, passed back to `handle_response`.
    pub fn ctx(&self) -> u32 {
        self.ctx
    }

    /// Abandon the request, releasing the guest.
    pub fn cancel(self) -> MiddlewareError {
        drop(self);
        MiddlewareError::Cancelled
    }

    pub(crate) async fn resume(self, is_error: bool) -> Result<(), MiddlewareError> {
        match self.pending {
            Pending::Pooled(suspended) => suspended.resume(self.ctx, is_error).await,
            Pending::OneShot(suspended) => suspended.resume(is_error).await,
        }
    }
}

impl fmt::Debug for NextCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strategy = match self.pending {
            Pending::Pooled(_) => "pooled",
            Pending::OneShot(_) => "one_shot",
        };
        f.debug_struct("NextCall")
            .field("ctx", &self.ctx)
            .field("strategy", &strategy)
            .finish()
    }
}

pub(crate) fn join_error(err: JoinError) -> MiddlewareError {
    if err.is_cancelled() {
        MiddlewareError::Cancelled
    } else {
        MiddlewareError::Panicked(err.to_string())
    }
}

/// Log a failed guest call.
pub(crate) fn report_failure(instance: Option<u64>, err: &MiddlewareError) {
    match err {
        MiddlewareError::Cancelled => log_request_cancelled!(?instance, "guest aborted"),
        _ => log_guest_trap!(
            ?instance,
            class = failure_class(err),
            error = %err,
            "guest call failed"
        ),
    }
}
