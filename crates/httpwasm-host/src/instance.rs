//! Guest instance management.
//!
//! A [`GuestFactory`] links the host module once and stamps out
//! [`GuestInstance`]s from it. Each instance wraps a wasmtime store whose data
//! is a [`GuestState`]: the request in scope (if any), the POSIX-subset
//! context and the resource limiter.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use httpwasm_telemetry::{log_instance_created, MetricsRegistry};
use wasmtime::{Engine, InstancePre, Linker, Memory, Module, Store, TypedFunc, UpdateDeadline};
use wasmtime_wasi::p1::WasiP1Ctx;

use crate::abi::{self, exports, Features};
use crate::bridge;
use crate::config::{DispatchStrategy, MiddlewareConfig, ModuleConfig};
use crate::engine::GuestEngine;
use crate::error::{Aborted, MiddlewareError};
use crate::host::Logger;
use crate::limits::GuestLimiter;
use crate::state::RequestState;
use crate::trap::{failure_class, guest_error, TrapPhase};

/// Middleware-wide state shared by every instance.
pub(crate) struct Shared {
    pub(crate) guest_config: Vec<u8>,
    pub(crate) logger: Arc<dyn Logger>,
    features: AtomicU32,
    sealed: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: &MiddlewareConfig) -> Self {
        Self {
            guest_config: config.guest_config.clone(),
            logger: config.logger.clone(),
            features: AtomicU32::new(0),
            sealed: AtomicBool::new(false),
        }
    }

    /// Features enabled outside any request.
    pub(crate) fn features(&self) -> Features {
        Features::from_bits(self.features.load(Ordering::Acquire))
    }

    /// Enable `features` middleware-wide, returning the new set.
    ///
    /// Once sealed the set is read-only: start functions of instances
    /// created while serving requests get the current set back unchanged.
    pub(crate) fn enable_features(&self, features: Features) -> Features {
        if self.sealed.load(Ordering::Acquire) {
            return self.features();
        }
        let previous = self.features.fetch_or(features.bits(), Ordering::AcqRel);
        Features::from_bits(previous | features.bits())
    }

    /// Freeze the middleware-wide feature set before the first request.
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }
}

/// Data attached to each guest store.
pub(crate) struct GuestState {
    /// The request being served; `None` while start functions run.
    pub(crate) request: Option<RequestState>,
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) shared: Arc<Shared>,
    /// The guest's memory export, resolved once after instantiation.
    pub(crate) memory: Option<Memory>,
    limiter: GuestLimiter,
}

impl GuestState {
    pub(crate) fn is_aborted(&self) -> bool {
        self.request.as_ref().is_some_and(RequestState::is_aborted)
    }
}

/// Creates guest instances from one compiled module.
pub(crate) struct GuestFactory {
    pre: InstancePre<GuestState>,
    engine: GuestEngine,
    shared: Arc<Shared>,
    module_config: ModuleConfig,
    metrics: Option<Arc<MetricsRegistry>>,
    next_id: AtomicU64,
}

impl GuestFactory {
    /// Link the host module (and the POSIX subset, if `uses_wasi`) against
    /// `module`.
    pub(crate) fn new(
        engine: GuestEngine,
        module: &Module,
        config: &MiddlewareConfig,
        uses_wasi: bool,
    ) -> Result<Self, MiddlewareError> {
        let mut linker = Linker::new(engine.engine());
        bridge::add_to_linker(&mut linker, config.strategy)?;
        if uses_wasi {
            wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut GuestState| {
                &mut state.wasi
            })
            .map_err(|e| {
                MiddlewareError::Instantiation(format!("failed to link {}: {e}", abi::WASI_MODULE))
            })?;
        }

        let pre = linker
            .instantiate_pre(module)
            .map_err(|e| MiddlewareError::Instantiation(e.to_string()))?;

        Ok(Self {
            pre,
            engine,
            shared: Arc::new(Shared::new(config)),
            module_config: config.module.clone(),
            metrics: config.metrics.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn engine(&self) -> &Engine {
        self.engine.engine()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.metrics.as_ref()
    }

    /// Create an instance and run its start function.
    ///
    /// This executes guest code and so blocks.
    pub(crate) fn instantiate(&self) -> Result<GuestInstance, MiddlewareError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let limits = self.engine.limits();

        let state = GuestState {
            request: None,
            wasi: self.module_config.build_wasi(),
            shared: self.shared.clone(),
            memory: None,
            limiter: GuestLimiter::new(limits),
        };
        let mut store = Store::new(self.engine.engine(), state);
        store.limiter(|state| &mut state.limiter);
        store
            .set_fuel(limits.max_fuel)
            .map_err(|e| MiddlewareError::Instantiation(format!("failed to set fuel: {e}")))?;
        // Epochs only advance when a request is aborted; every store then
        // checks whether the abort was its own.
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|store| {
            if store.data().is_aborted() {
                return Err(wasmtime::Error::new(Aborted));
            }
            Ok(UpdateDeadline::Continue(1))
        });

        let instance = self
            .pre
            .instantiate(&mut store)
            .map_err(|e| MiddlewareError::Instantiation(e.to_string()))?;

        let memory = instance
            .get_memory(&mut store, abi::MEMORY_EXPORT)
            .ok_or_else(|| MiddlewareError::MissingExport(abi::MEMORY_EXPORT.into()))?;
        store.data_mut().memory = Some(memory);

        let handle_request = instance
            .get_typed_func::<(), i64>(&mut store, exports::HANDLE_REQUEST)
            .map_err(|_| MiddlewareError::MissingExport(exports::HANDLE_REQUEST.into()))?;
        let handle_response = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, exports::HANDLE_RESPONSE)
            .ok();
        let start = [exports::INITIALIZE, exports::START]
            .into_iter()
            .find_map(|name| instance.get_typed_func::<(), ()>(&mut store, name).ok());

        let mut guest = GuestInstance {
            id,
            store,
            handle_request,
            handle_response,
            max_fuel: limits.max_fuel,
            metrics: self.metrics.clone(),
        };

        if let Some(start) = start {
            guest.run_start(start)?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.instance_created();
        }
        log_instance_created!(instance = id, "guest instance created");

        Ok(guest)
    }
}

/// One instantiated guest.
///
/// Serves at most one request at a time; the `&mut self` receivers enforce
/// it.
pub(crate) struct GuestInstance {
    id: u64,
    store: Store<GuestState>,
    handle_request: TypedFunc<(), i64>,
    handle_response: Option<TypedFunc<(i32, i32), ()>>,
    max_fuel: u64,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl GuestInstance {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn run_start(&mut self, start: TypedFunc<(), ()>) -> Result<(), MiddlewareError> {
        let started = Instant::now();
        let result = match start.call(&mut self.store, ()) {
            Ok(()) => Ok(()),
            Err(err) => match err.downcast_ref::<wasmtime_wasi::I32Exit>() {
                Some(exit) if exit.0 == 0 => Ok(()),
                _ => Err(guest_error(err, TrapPhase::Init)),
            },
        };
        self.record(TrapPhase::Init, started, &result);
        result
    }

    /// Put `request` in scope for the following entrypoint calls.
    pub(crate) fn begin(&mut self, request: RequestState) {
        self.store.data_mut().request = Some(request);
    }

    /// Call `handle_request`, returning the raw `(ctx << 32) | next` value.
    ///
    /// A one-shot guest that returned from `await_response` before failing
    /// is reported in the response phase.
    pub(crate) fn call_handle_request(&mut self) -> Result<u64, MiddlewareError> {
        self.ensure_live()?;
        self.refuel(TrapPhase::Request)?;
        let started = Instant::now();
        let result = self.handle_request.call(&mut self.store, ());
        let phase = match self.store.data().request.as_ref() {
            Some(request) if request.after_next() => TrapPhase::Response,
            _ => TrapPhase::Request,
        };
        let result = result
            .map(|value| value as u64)
            .map_err(|e| guest_error(e, phase));
        self.record(phase, started, &result);
        result
    }

    /// Enter the response phase and call `handle_response`.
    pub(crate) fn call_handle_response(
        &mut self,
        ctx: u32,
        is_error: bool,
    ) -> Result<(), MiddlewareError> {
        let func = self
            .handle_response
            .clone()
            .ok_or_else(|| MiddlewareError::MissingExport(exports::HANDLE_RESPONSE.into()))?;
        self.ensure_live()?;
        if let Some(request) = self.store.data_mut().request.as_mut() {
            request.begin_response();
        }

        self.refuel(TrapPhase::Response)?;
        let started = Instant::now();
        let result = func
            .call(&mut self.store, (ctx as i32, i32::from(is_error)))
            .map_err(|e| guest_error(e, TrapPhase::Response));
        self.record(TrapPhase::Response, started, &result);
        result
    }

    /// Take the request out of scope, flushing its body writers.
    pub(crate) fn end(&mut self, phase: TrapPhase) -> Result<(), MiddlewareError> {
        match self.store.data_mut().request.take() {
            Some(mut request) => request
                .close()
                .map_err(|source| MiddlewareError::Host { phase, source }),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn read_memory(&self, offset: usize, len: usize) -> Vec<u8> {
        let memory = self.store.data().memory.expect("guest exports memory");
        memory.data(&self.store)[offset..offset + len].to_vec()
    }

    /// Refuse to enter the guest for a request that is already aborted.
    ///
    /// An abort raised before this check bumped the epoch too early for this
    /// store's deadline to notice it.
    fn ensure_live(&self) -> Result<(), MiddlewareError> {
        if self.store.data().is_aborted() {
            return Err(MiddlewareError::Cancelled);
        }
        Ok(())
    }

    fn refuel(&mut self, phase: TrapPhase) -> Result<(), MiddlewareError> {
        self.store
            .set_fuel(self.max_fuel)
            .map_err(|e| guest_error(e, phase))
    }

    fn record<T>(&self, phase: TrapPhase, started: Instant, result: &Result<T, MiddlewareError>) {
        if let Some(metrics) = &self.metrics {
            let trap = result.as_ref().err().map(failure_class);
            metrics.record_guest_call(phase.as_str(), started.elapsed().as_secs_f64(), trap);
        }
    }
}
