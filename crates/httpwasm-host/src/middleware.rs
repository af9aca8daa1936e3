//! The embedder-facing middleware handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use httpwasm_telemetry::{log_guest_compiled, log_middleware_closed};

use crate::abi::Features;
use crate::config::{DispatchStrategy, MiddlewareConfig};
use crate::dispatch::one_shot::OneShotDispatcher;
use crate::dispatch::pooled::PooledDispatcher;
use crate::dispatch::{join_error, Flow, NextCall};
use crate::engine::GuestEngine;
use crate::error::MiddlewareError;
use crate::host::Host;
use crate::instance::GuestFactory;
use crate::validate::{validate_exports, validate_imports};

enum Dispatcher {
    Pooled(PooledDispatcher),
    OneShot(OneShotDispatcher),
}

/// A compiled, validated guest ready to serve requests.
///
/// Share it across tasks behind an `Arc`; every method takes `&self`.
pub struct Middleware {
    dispatcher: Dispatcher,
    factory: Arc<GuestFactory>,
    strategy: DispatchStrategy,
    closed: AtomicBool,
}

impl Middleware {
    /// Compile `wasm`, check it against the ABI and instantiate it once.
    ///
    /// The first instance runs the guest's start function, so features it
    /// enables are visible through [`Middleware::features`] as soon as this
    /// returns. For the pooled strategy that instance serves the first
    /// request.
    pub fn new(wasm: &[u8], config: MiddlewareConfig) -> Result<Self, MiddlewareError> {
        let engine = GuestEngine::with_limits(config.limits.clone())?;
        let module = engine.compile(wasm)?;
        validate_exports(&module, config.strategy)?;
        let imports = validate_imports(&module, config.strategy)?;

        log_guest_compiled!(
            strategy = %config.strategy,
            wasi = imports.uses_wasi,
            size = wasm.len(),
            "guest module compiled"
        );

        let factory = Arc::new(GuestFactory::new(
            engine,
            &module,
            &config,
            imports.uses_wasi,
        )?);
        let dispatcher = match config.strategy {
            DispatchStrategy::Pooled => Dispatcher::Pooled(PooledDispatcher::new(factory.clone())?),
            DispatchStrategy::OneShot => {
                Dispatcher::OneShot(OneShotDispatcher::new(factory.clone())?)
            }
        };
        // Only the warm-up instance may widen the middleware-wide features.
        factory.shared().seal();

        Ok(Self {
            dispatcher,
            factory,
            strategy: config.strategy,
            closed: AtomicBool::new(false),
        })
    }

    /// Features enabled middleware-wide by the guest's start function.
    pub fn features(&self) -> Features {
        self.factory.shared().features()
    }

    pub fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    /// Idle pooled instances. Always zero for the one-shot strategy.
    pub fn idle_instances(&self) -> usize {
        match &self.dispatcher {
            Dispatcher::Pooled(pooled) => pooled.idle_instances(),
            Dispatcher::OneShot(_) => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run the request phase.
    ///
    /// On [`Flow::Next`] the embedder runs the upstream and then calls
    /// [`Middleware::handle_response`]. Any error means the response must be
    /// a 500-class failure.
    pub async fn handle_request(&self, host: Arc<dyn Host>) -> Result<Flow, MiddlewareError> {
        if self.is_closed() {
            return Err(MiddlewareError::Closed);
        }
        match &self.dispatcher {
            Dispatcher::Pooled(pooled) => pooled.handle_request(host).await,
            Dispatcher::OneShot(one_shot) => one_shot.handle_request(host).await,
        }
    }

    /// Run the response phase after the upstream has completed.
    ///
    /// `is_error` reports whether the upstream failed. Requests already
    /// suspended may finish after [`Middleware::close`].
    pub async fn handle_response(
        &self,
        next: NextCall,
        is_error: bool,
    ) -> Result<(), MiddlewareError> {
        next.resume(is_error).await
    }

    /// Run both phases, calling [`Host::next`] for the upstream.
    pub async fn handle(&self, host: Arc<dyn Host>) -> Result<(), MiddlewareError> {
        let next = match self.handle_request(host.clone()).await? {
            Flow::Done => return Ok(()),
            Flow::Next(next) => next,
        };

        let upstream = tokio::task::spawn_blocking(move || host.next())
            .await
            .map_err(join_error)?;
        let is_error = match upstream {
            Ok(()) => false,
            Err(err) => {
                tracing::warn!(error = %err, "upstream failed");
                true
            }
        };

        self.handle_response(next, is_error).await
    }

    /// Stop accepting requests and release idle instances.
    ///
    /// Idempotent. Requests already suspended may still complete; their
    /// instances are discarded rather than returned.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Dispatcher::Pooled(pooled) = &self.dispatcher {
            pooled.close();
        }
        log_middleware_closed!(strategy = %self.strategy, "middleware closed");
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("strategy", &self.strategy)
            .field("features", &self.features())
            .field("closed", &self.is_closed())
            .finish()
    }
}
