//! WASM engine configuration and compilation.
//!
//! Provides the wasmtime engine with settings suited to running many small,
//! short-lived guest calls.

use wasmtime::{Config, Engine, Module, OptLevel};

use crate::error::MiddlewareError;
use crate::limits::GuestLimits;

/// The WASM engine that compiles guest modules.
#[derive(Clone)]
pub struct GuestEngine {
    engine: Engine,
    limits: GuestLimits,
}

impl GuestEngine {
    /// Create an engine with default limits.
    pub fn new() -> Result<Self, MiddlewareError> {
        Self::with_limits(GuestLimits::default())
    }

    /// Create an engine enforcing `limits`.
    pub fn with_limits(limits: GuestLimits) -> Result<Self, MiddlewareError> {
        let mut config = Config::new();

        // Guest calls are synchronous; async rendezvous happens outside wasmtime.
        config.async_support(false);

        config.cranelift_opt_level(OptLevel::Speed);

        // Fuel bounds the execution time of each guest call.
        config.consume_fuel(true);

        // Epoch checks let a cancelled request stop a guest mid-computation.
        config.epoch_interruption(true);

        config.max_wasm_stack(limits.max_stack_bytes);

        config.wasm_reference_types(true);
        config.wasm_bulk_memory(true);
        config.wasm_multi_value(true);

        // Guest instances are single-threaded.
        config.wasm_threads(false);

        let engine =
            Engine::new(&config).map_err(|e| MiddlewareError::EngineCreation(e.to_string()))?;

        Ok(Self { engine, limits })
    }

    /// Get the underlying wasmtime engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the configured limits.
    pub fn limits(&self) -> &GuestLimits {
        &self.limits
    }

    /// Compile a guest from WASM binary or text.
    pub fn compile(&self, wasm: &[u8]) -> Result<Module, MiddlewareError> {
        Module::new(&self.engine, wasm).map_err(|e| MiddlewareError::Compilation(e.to_string()))
    }

    /// Validate a guest without compiling it.
    pub fn validate(&self, wasm: &[u8]) -> Result<(), MiddlewareError> {
        Module::validate(&self.engine, wasm)
            .map_err(|e| MiddlewareError::Compilation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal valid WASM module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic number
        0x01, 0x00, 0x00, 0x00, // version
    ];

    #[test]
    fn create_engine() {
        assert!(GuestEngine::new().is_ok());
    }

    #[test]
    fn create_engine_with_limits() {
        let limits = GuestLimits::default().with_stack(2 * 1024 * 1024);
        let engine = GuestEngine::with_limits(limits).unwrap();
        assert_eq!(engine.limits().max_stack_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn validate_minimal_wasm() {
        let engine = GuestEngine::new().unwrap();
        assert!(engine.validate(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn validate_invalid_wasm() {
        let engine = GuestEngine::new().unwrap();
        let invalid = &[0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            engine.validate(invalid),
            Err(MiddlewareError::Compilation(_))
        ));
    }

    #[test]
    fn compile_minimal_wasm() {
        let engine = GuestEngine::new().unwrap();
        assert!(engine.compile(MINIMAL_WASM).is_ok());
    }
}
