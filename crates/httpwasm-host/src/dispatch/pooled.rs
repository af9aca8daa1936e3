//! Pooled dispatch: two guest calls on one pinned instance.
//!
//! `Idle -> InRequest -> Idle` when the guest answers itself, or
//! `Idle -> InRequest -> Suspended -> InResponse -> Idle` when it calls
//! next. A failed or cancelled instance never goes back to the pool.

use std::sync::Arc;

use crate::abi::unpack;
use crate::dispatch::{join_error, report_failure, Flow, NextCall, Pending};
use crate::error::MiddlewareError;
use crate::host::Host;
use crate::instance::{GuestFactory, GuestInstance};
use crate::pool::{DiscardReason, InstancePool};
use crate::state::{AbortOnDrop, AbortSignal, RequestState};
use crate::trap::TrapPhase;

pub(crate) struct PooledDispatcher {
    factory: Arc<GuestFactory>,
    pool: Arc<InstancePool>,
}

impl PooledDispatcher {
    /// Create the dispatcher with one pre-warmed instance.
    pub(crate) fn new(factory: Arc<GuestFactory>) -> Result<Self, MiddlewareError> {
        let pool = Arc::new(InstancePool::new(factory.metrics().cloned()));
        pool.checkin(factory.instantiate()?);
        Ok(Self { factory, pool })
    }

    pub(crate) fn idle_instances(&self) -> usize {
        self.pool.len()
    }

    pub(crate) fn close(&self) {
        self.pool.close();
    }

    pub(crate) async fn handle_request(&self, host: Arc<dyn Host>) -> Result<Flow, MiddlewareError> {
        let factory = self.factory.clone();
        let pool = self.pool.clone();
        let features = factory.shared().features();
        let abort = AbortSignal::new(factory.engine());
        let request_abort = abort.clone();

        // Dropping this future aborts the guest.
        let guard = AbortOnDrop::new(abort.clone());
        let task = tokio::task::spawn_blocking(move || {
            let instance = match pool.checkout() {
                Some(instance) => instance,
                None => factory.instantiate()?,
            };
            let mut pinned = Pinned::new(instance, pool);
            let instance = pinned.instance_mut();
            instance.begin(
                RequestState::new(host, features, instance.id()).with_abort(request_abort),
            );

            let result = instance.call_handle_request().and_then(|value| {
                if unpack(value).1 == 0 {
                    instance.end(TrapPhase::Request)?;
                }
                Ok(value)
            });
            Ok::<_, MiddlewareError>((pinned, result))
        });
        let joined = task.await;
        guard.disarm();
        let (pinned, result) = joined.map_err(join_error)??;

        match result {
            Ok(value) => {
                let (ctx, next) = unpack(value);
                if next == 0 {
                    pinned.release();
                    Ok(Flow::Done)
                } else {
                    Ok(Flow::Next(NextCall::new(
                        ctx,
                        Pending::Pooled(Suspended { pinned, abort }),
                    )))
                }
            }
            Err(err) => {
                report_failure(Some(pinned.id()), &err);
                pinned.discard(DiscardReason::Failed);
                Err(err)
            }
        }
    }
}

/// A pooled request waiting for the upstream.
pub(crate) struct Suspended {
    pinned: Pinned,
    abort: AbortSignal,
}

impl Suspended {
    pub(crate) async fn resume(self, ctx: u32, is_error: bool) -> Result<(), MiddlewareError> {
        let Suspended { mut pinned, abort } = self;

        let guard = AbortOnDrop::new(abort);
        let task = tokio::task::spawn_blocking(move || {
            let instance = pinned.instance_mut();
            let result = instance
                .call_handle_response(ctx, is_error)
                .and_then(|()| instance.end(TrapPhase::Response));
            (pinned, result)
        });
        let joined = task.await;
        guard.disarm();
        let (pinned, result) = joined.map_err(join_error)?;

        match result {
            Ok(()) => {
                pinned.release();
                Ok(())
            }
            Err(err) => {
                report_failure(Some(pinned.id()), &err);
                pinned.discard(DiscardReason::Failed);
                Err(err)
            }
        }
    }
}

/// An instance checked out for one request.
///
/// Goes back to the pool only through [`Pinned::release`]; dropped any
/// other way it counts as cancelled and is discarded, which also closes the
/// request's body handles.
struct Pinned {
    instance: Option<GuestInstance>,
    pool: Arc<InstancePool>,
}

impl Pinned {
    fn new(instance: GuestInstance, pool: Arc<InstancePool>) -> Self {
        Self {
            instance: Some(instance),
            pool,
        }
    }

    fn instance_mut(&mut self) -> &mut GuestInstance {
        self.instance
            .as_mut()
            .expect("pinned instance is present until released")
    }

    fn id(&self) -> u64 {
        self.instance.as_ref().map_or(0, GuestInstance::id)
    }

    fn release(mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.checkin(instance);
        }
    }

    fn discard(mut self, reason: DiscardReason) {
        if let Some(instance) = self.instance.take() {
            self.pool.discard(instance, reason);
        }
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.discard(instance, DiscardReason::Cancelled);
        }
    }
}
