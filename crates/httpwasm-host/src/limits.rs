//! Resource limits for guest execution.
//!
//! Each guest instance is constrained by default to:
//! - Linear memory: 64 MB
//! - Stack size: 1 MB
//! - Fuel per guest call: roughly 100 ms of execution

use serde::Deserialize;

/// Resource limits for guest instances.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GuestLimits {
    /// Maximum linear memory in bytes.
    pub max_memory_bytes: usize,

    /// Maximum WASM stack in bytes.
    pub max_stack_bytes: usize,

    /// Execution time budget per guest call, in milliseconds.
    pub max_execution_ms: u64,

    /// Fuel granted before each guest call.
    /// Calibrated to roughly correspond to `max_execution_ms`.
    pub max_fuel: u64,

    /// Maximum table elements.
    pub max_table_elements: usize,
}

impl Default for GuestLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024, // 64 MB
            max_stack_bytes: 1024 * 1024,       // 1 MB
            max_execution_ms: 100,
            max_fuel: 100_000_000,
            max_table_elements: 10_000,
        }
    }
}

impl GuestLimits {
    /// Set the linear memory cap.
    pub fn with_memory(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Set the stack cap.
    pub fn with_stack(mut self, bytes: usize) -> Self {
        self.max_stack_bytes = bytes;
        self
    }

    /// Set the per-call execution budget; fuel scales with it.
    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.max_execution_ms = ms;
        self.max_fuel = ms * 1_000_000;
        self
    }

    /// Set the fuel granted per guest call directly.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = fuel;
        self
    }
}

/// Enforces [`GuestLimits`] on a store's memories and tables.
#[derive(Debug, Clone)]
pub struct GuestLimiter {
    max_memory_bytes: usize,
    max_table_elements: usize,
}

impl GuestLimiter {
    pub fn new(limits: &GuestLimits) -> Self {
        Self {
            max_memory_bytes: limits.max_memory_bytes,
            max_table_elements: limits.max_table_elements,
        }
    }
}

impl wasmtime::ResourceLimiter for GuestLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_memory_bytes)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::ResourceLimiter;

    #[test]
    fn default_limits() {
        let limits = GuestLimits::default();
        assert_eq!(limits.max_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(limits.max_stack_bytes, 1024 * 1024);
        assert_eq!(limits.max_execution_ms, 100);
    }

    #[test]
    fn custom_limits() {
        let limits = GuestLimits::default()
            .with_memory(32 * 1024 * 1024)
            .with_stack(2 * 1024 * 1024)
            .with_timeout(200);

        assert_eq!(limits.max_memory_bytes, 32 * 1024 * 1024);
        assert_eq!(limits.max_stack_bytes, 2 * 1024 * 1024);
        assert_eq!(limits.max_execution_ms, 200);
        assert_eq!(limits.max_fuel, 200_000_000);
    }

    #[test]
    fn limiter_allows_within_limits() {
        let mut limiter = GuestLimiter::new(&GuestLimits::default().with_memory(1024 * 1024));
        assert!(limiter.memory_growing(0, 64 * 1024, None).unwrap());
        assert!(limiter.memory_growing(0, 1024 * 1024, None).unwrap());
    }

    #[test]
    fn limiter_denies_over_limit() {
        let mut limiter = GuestLimiter::new(&GuestLimits::default().with_memory(1024 * 1024));
        assert!(!limiter.memory_growing(0, 2 * 1024 * 1024, None).unwrap());
        assert!(!limiter.table_growing(0, 10_001, None).unwrap());
    }
}
