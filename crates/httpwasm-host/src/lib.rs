//! Host runtime for HTTP middleware written as WebAssembly guests.
//!
//! A guest module imports the `http-handler` host module and exports
//! `handle_request` (and, for the pooled strategy, `handle_response`). This
//! crate compiles and validates such a guest, links the host functions
//! against an embedder-supplied [`Host`], and drives the two-phase
//! request/response protocol:
//!
//! ```ignore
//! let middleware = Middleware::new(&wasm, MiddlewareConfig::default())?;
//! match middleware.handle_request(host.clone()).await? {
//!     Flow::Done => { /* the guest wrote the response */ }
//!     Flow::Next(next) => {
//!         let is_error = run_upstream(&host).await.is_err();
//!         middleware.handle_response(next, is_error).await?;
//!     }
//! }
//! ```
//!
//! Any error from either phase means the guest failed and the embedder
//! should answer with a 500-class response.

pub mod abi;
mod bridge;
pub mod config;
mod dispatch;
mod engine;
mod error;
mod host;
mod instance;
mod limits;
pub mod memory;
mod middleware;
mod pool;
mod state;
mod trap;
mod validate;

#[cfg(test)]
mod testing;

pub use abi::{BodyKind, Features, HeaderKind, LogLevel};
pub use config::{DispatchStrategy, MiddlewareConfig, ModuleConfig, RuntimeSettings};
pub use dispatch::{Flow, NextCall};
pub use engine::GuestEngine;
pub use error::{GuestFault, HostError, MiddlewareError, Target};
pub use host::{BodyReader, BodyWriter, Host, Logger, NopLogger, TracingLogger, GUEST_LOG_TARGET};
pub use limits::GuestLimits;
pub use middleware::Middleware;
pub use trap::{classify_trap, TrapPhase};
pub use validate::{validate_exports, validate_imports, ImportSummary};
