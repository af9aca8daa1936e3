//! Middleware configuration.
//!
//! [`MiddlewareConfig`] is built in code; [`RuntimeSettings`] is the subset
//! that can be loaded from a TOML document and applied on top of it.

use std::fmt;
use std::sync::Arc;

use httpwasm_telemetry::MetricsRegistry;
use serde::Deserialize;
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::WasiCtxBuilder;

use crate::error::MiddlewareError;
use crate::host::{Logger, TracingLogger};
use crate::limits::GuestLimits;

/// How the host suspends the guest across the upstream call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// `handle_request` and `handle_response` on a pooled instance.
    #[default]
    Pooled,
    /// One entrypoint per fresh instance, suspended in `await_response`.
    OneShot,
}

impl DispatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStrategy::Pooled => "pooled",
            DispatchStrategy::OneShot => "one_shot",
        }
    }
}

impl fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding of the guest's POSIX subset, used only when the guest imports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Connect guest stdout to the host's.
    pub inherit_stdout: bool,
    /// Connect guest stderr to the host's.
    pub inherit_stderr: bool,
    /// Program arguments, including the program name.
    pub args: Vec<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
}

impl ModuleConfig {
    pub fn with_stdout(mut self) -> Self {
        self.inherit_stdout = true;
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.inherit_stderr = true;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub(crate) fn build_wasi(&self) -> WasiP1Ctx {
        let mut builder = WasiCtxBuilder::new();
        if self.inherit_stdout {
            builder.inherit_stdout();
        }
        if self.inherit_stderr {
            builder.inherit_stderr();
        }
        builder.args(self.args.as_slice());
        builder.envs(self.env.as_slice());
        builder.build_p1()
    }
}

/// Everything a middleware needs besides the guest binary.
#[derive(Clone)]
pub struct MiddlewareConfig {
    pub guest_config: Vec<u8>,
    pub strategy: DispatchStrategy,
    pub limits: GuestLimits,
    pub module: ModuleConfig,
    pub logger: Arc<dyn Logger>,
    pub metrics: Option<Arc<MetricsRegistry>>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            guest_config: Vec::new(),
            strategy: DispatchStrategy::default(),
            limits: GuestLimits::default(),
            module: ModuleConfig::default(),
            logger: Arc::new(TracingLogger),
            metrics: None,
        }
    }
}

impl fmt::Debug for MiddlewareConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareConfig")
            .field("guest_config_len", &self.guest_config.len())
            .field("strategy", &self.strategy)
            .field("limits", &self.limits)
            .field("module", &self.module)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl MiddlewareConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opaque bytes returned to the guest by `get_config`.
    pub fn with_guest_config(mut self, config: impl Into<Vec<u8>>) -> Self {
        self.guest_config = config.into();
        self
    }

    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_limits(mut self, limits: GuestLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_module_config(mut self, module: ModuleConfig) -> Self {
        self.module = module;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Settings loadable from TOML.
///
/// ```toml
/// strategy = "one_shot"
/// guest_config = "open sesame"
///
/// [limits]
/// max_memory_bytes = 16777216
/// max_fuel = 50000000
///
/// [module]
/// inherit_stderr = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
    pub strategy: Option<DispatchStrategy>,
    /// UTF-8 guest configuration. Binary configuration must be set in code.
    pub guest_config: Option<String>,
    pub limits: Option<GuestLimits>,
    pub module: Option<ModuleConfig>,
}

impl RuntimeSettings {
    pub fn from_toml_str(source: &str) -> Result<Self, MiddlewareError> {
        let settings: RuntimeSettings = toml::from_str(source)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), MiddlewareError> {
        if let Some(limits) = &self.limits {
            if limits.max_fuel == 0 {
                return Err(MiddlewareError::Config("limits.max_fuel must be positive".into()));
            }
            if limits.max_memory_bytes == 0 {
                return Err(MiddlewareError::Config(
                    "limits.max_memory_bytes must be positive".into(),
                ));
            }
        }
        Ok(())
    }

    /// Override the fields of `config` that these settings name.
    pub fn apply(self, mut config: MiddlewareConfig) -> MiddlewareConfig {
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(guest_config) = self.guest_config {
            config.guest_config = guest_config.into_bytes();
        }
        if let Some(limits) = self.limits {
            config.limits = limits;
        }
        if let Some(module) = self.module {
            config.module = module;
        }
        config
    }
}
