//! One-shot dispatch: a fresh guest per request, parked across the upstream.
//!
//! The guest exports only `handle_request` and imports `await_response`.
//! It runs on a blocking thread; `await_response` hands `(ctx, next)` to the
//! async side and parks until the upstream outcome comes back. Two oneshot
//! channels form the rendezvous:
//!
//! ```text
//! guest thread                      request task
//! ------------                      ------------
//! await_response(ctx_next) ──u64──▶ awaiting.await
//!                                   run upstream
//! blocking_recv()          ◀─bool── ready.send(is_error)
//! finish handle_request             join guest thread
//! ```
//!
//! If either side goes away the other observes a closed channel: a guest
//! that returns without awaiting ends the request, and a dropped request
//! aborts the guest, whether it is parked at the rendezvous or still
//! running.

use std::sync::Arc;

use httpwasm_telemetry::{log_request_cancelled, MetricsRegistry};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::abi::{unpack, Features};
use crate::dispatch::{join_error, report_failure, Flow, NextCall, Pending};
use crate::error::{Aborted, MiddlewareError};
use crate::host::Host;
use crate::instance::GuestFactory;
use crate::state::{AbortSignal, RequestState};
use crate::trap::TrapPhase;

/// Guest-side end of the rendezvous.
pub(crate) struct Rendezvous {
    awaiting: oneshot::Sender<u64>,
    ready: oneshot::Receiver<bool>,
}

impl Rendezvous {
    /// Publish `ctx_next` and, if the guest asked for next, block until the
    /// upstream has run. Returns the upstream's `is_error`.
    pub(crate) fn await_response(self, ctx_next: u64) -> Result<bool, Aborted> {
        let Rendezvous { awaiting, ready } = self;
        awaiting.send(ctx_next).map_err(|_| Aborted)?;
        if unpack(ctx_next).1 == 0 {
            return Ok(false);
        }
        ready.blocking_recv().map_err(|_| Aborted)
    }
}

pub(crate) struct OneShotDispatcher {
    factory: Arc<GuestFactory>,
}

impl OneShotDispatcher {
    /// Create the dispatcher, instantiating once so that a broken start
    /// function fails here rather than on the first request.
    pub(crate) fn new(factory: Arc<GuestFactory>) -> Result<Self, MiddlewareError> {
        drop(factory.instantiate()?);
        Ok(Self { factory })
    }

    pub(crate) async fn handle_request(&self, host: Arc<dyn Host>) -> Result<Flow, MiddlewareError> {
        let (awaiting_tx, awaiting_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let rendezvous = Rendezvous {
            awaiting: awaiting_tx,
            ready: ready_rx,
        };

        let factory = self.factory.clone();
        let features = factory.shared().features();
        let abort = AbortSignal::new(factory.engine());
        let request_abort = abort.clone();
        let guest = GuestTask {
            handle: Some(tokio::task::spawn_blocking(move || {
                run_guest(&factory, host, features, rendezvous, request_abort)
            })),
            abort,
            metrics: self.factory.metrics().cloned(),
        };

        match awaiting_rx.await {
            Ok(ctx_next) => {
                let (ctx, next) = unpack(ctx_next);
                if next == 0 {
                    drop(ready_tx);
                    guest.join().await?;
                    return Ok(Flow::Done);
                }
                Ok(Flow::Next(NextCall::new(
                    ctx,
                    Pending::OneShot(Suspended {
                        ready: ready_tx,
                        guest,
                    }),
                )))
            }
            // The guest returned (or failed) without awaiting.
            Err(_) => {
                guest.join().await?;
                Ok(Flow::Done)
            }
        }
    }
}

/// Run one request to completion on the current (blocking) thread.
fn run_guest(
    factory: &GuestFactory,
    host: Arc<dyn Host>,
    features: Features,
    rendezvous: Rendezvous,
    abort: AbortSignal,
) -> Result<(), MiddlewareError> {
    let mut instance = factory.instantiate()?;
    let request = RequestState::new(host, features, instance.id())
        .with_rendezvous(rendezvous)
        .with_abort(abort);
    instance.begin(request);

    let result = instance.call_handle_request();
    let closed = instance.end(TrapPhase::Response);
    let result = result.map(drop).and(closed);
    if let Err(err) = &result {
        report_failure(Some(instance.id()), err);
    }
    result
}

/// A one-shot guest parked in `await_response`.
pub(crate) struct Suspended {
    ready: oneshot::Sender<bool>,
    guest: GuestTask,
}

impl Suspended {
    pub(crate) async fn resume(self, is_error: bool) -> Result<(), MiddlewareError> {
        let Suspended { ready, guest } = self;
        // A closed channel means the guest already failed; joining reports why.
        let _ = ready.send(is_error);
        guest.join().await
    }
}

/// The blocking task running a one-shot guest.
///
/// Dropped before the guest has been joined, the request counts as
/// cancelled and the guest is aborted: its next host call or loop
/// back-edge traps, and its body handles close as the thread unwinds.
struct GuestTask {
    handle: Option<JoinHandle<Result<(), MiddlewareError>>>,
    abort: AbortSignal,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl GuestTask {
    async fn join(mut self) -> Result<(), MiddlewareError> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(MiddlewareError::Cancelled);
        };
        let joined = handle.await;
        self.handle = None;
        joined.map_err(join_error)?
    }
}

impl Drop for GuestTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.abort.abort();
            log_request_cancelled!("one-shot request dropped with guest in flight");
            if let Some(metrics) = &self.metrics {
                metrics.request_cancelled();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchStrategy, MiddlewareConfig};
    use crate::engine::GuestEngine;
    use crate::testing::StubHost;
    use std::time::Duration;

    // Awaits with ctx 7, then faults if the upstream failed.
    const AWAITING: &str = r#"
        (module
          (import "http-handler" "await_response" (func $await (param i64) (result i32)))
          (memory (export "memory") 1)
          (func (export "handle_request") (result i64)
            (if (call $await (i64.const 0x0000000700000001)) (then unreachable))
            (i64.const 0)))
    "#;

    fn dispatcher(wat: &str) -> OneShotDispatcher {
        dispatcher_with(wat, MiddlewareConfig::default())
    }

    fn dispatcher_with(wat: &str, config: MiddlewareConfig) -> OneShotDispatcher {
        let engine = GuestEngine::new().unwrap();
        let module = engine.compile(wat.as_bytes()).unwrap();
        let config = config.with_strategy(DispatchStrategy::OneShot);
        let factory = GuestFactory::new(engine, &module, &config, false).unwrap();
        OneShotDispatcher::new(Arc::new(factory)).unwrap()
    }

    #[tokio::test]
    async fn await_suspends_until_resumed() {
        let dispatcher = dispatcher(AWAITING);
        let host = Arc::new(StubHost::default());

        let Flow::Next(next) = dispatcher.handle_request(host).await.unwrap() else {
            panic!("guest should await");
        };
        assert_eq!(next.ctx(), 7);
        next.resume(false).await.unwrap();
    }

    #[tokio::test]
    async fn upstream_error_reaches_guest() {
        let dispatcher = dispatcher(AWAITING);
        let host = Arc::new(StubHost::default());

        let Flow::Next(next) = dispatcher.handle_request(host).await.unwrap() else {
            panic!("guest should await");
        };
        assert!(matches!(
            next.resume(true).await,
            Err(MiddlewareError::Trap {
                phase: TrapPhase::Response,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn returning_without_await_is_done() {
        let dispatcher = dispatcher(
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "handle_request") (result i64) (i64.const 1)))"#,
        );
        let host = Arc::new(StubHost::default());
        assert!(!dispatcher.handle_request(host).await.unwrap().is_next());
    }

    #[tokio::test]
    async fn await_without_next_returns_immediately() {
        let dispatcher = dispatcher(
            r#"(module
                 (import "http-handler" "await_response" (func $await (param i64) (result i32)))
                 (memory (export "memory") 1)
                 (func (export "handle_request") (result i64)
                   (drop (call $await (i64.const 0x0000000700000000)))
                   (i64.const 0)))"#,
        );
        let host = Arc::new(StubHost::default());
        assert!(!dispatcher.handle_request(host).await.unwrap().is_next());
    }

    #[tokio::test]
    async fn second_await_faults() {
        let dispatcher = dispatcher(
            r#"(module
                 (import "http-handler" "await_response" (func $await (param i64) (result i32)))
                 (memory (export "memory") 1)
                 (func (export "handle_request") (result i64)
                   (drop (call $await (i64.const 1)))
                   (drop (call $await (i64.const 1)))
                   (i64.const 0)))"#,
        );
        let host = Arc::new(StubHost::default());
        let Flow::Next(next) = dispatcher.handle_request(host).await.unwrap() else {
            panic!("guest should await");
        };
        assert!(matches!(
            next.resume(false).await,
            Err(MiddlewareError::GuestFault { .. })
        ));
    }

    #[tokio::test]
    async fn trap_before_await_fails_request() {
        let dispatcher = dispatcher(
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "handle_request") (result i64) unreachable))"#,
        );
        let host = Arc::new(StubHost::default());
        assert!(matches!(
            dispatcher.handle_request(host).await,
            Err(MiddlewareError::Trap {
                phase: TrapPhase::Request,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn dropped_next_call_aborts_guest() {
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = dispatcher_with(
            AWAITING,
            MiddlewareConfig::default().with_metrics(metrics.clone()),
        );
        let host = Arc::new(StubHost::default());

        let Flow::Next(next) = dispatcher.handle_request(host.clone()).await.unwrap() else {
            panic!("guest should await");
        };
        assert!(matches!(next.cancel(), MiddlewareError::Cancelled));
        assert_eq!(metrics.requests_cancelled_total.get(), 1);

        // The aborted guest thread winds down on its own; later requests are
        // unaffected.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let Flow::Next(next) = dispatcher.handle_request(host).await.unwrap() else {
            panic!("guest should await");
        };
        next.resume(false).await.unwrap();
    }

    #[test]
    fn rendezvous_reports_abort_when_host_is_gone() {
        let (awaiting_tx, awaiting_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel::<bool>();
        let rendezvous = Rendezvous {
            awaiting: awaiting_tx,
            ready: ready_rx,
        };
        drop(ready_tx);
        drop(awaiting_rx);
        assert!(rendezvous.await_response(1).is_err());
    }
}
