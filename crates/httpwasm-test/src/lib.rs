//! Test harnesses for httpwasm guests.
//!
//! Provides [`ExchangeHost`], an in-memory HTTP exchange with a pluggable
//! upstream, and [`guests`], WAT fixtures exercising the host ABI.

pub mod exchange;
pub mod guests;

use httpwasm_host::{Middleware, MiddlewareConfig, MiddlewareError};
use thiserror::Error;

pub use exchange::{ExchangeHost, Upstream};

/// Errors from building a test middleware.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("invalid WAT: {0}")]
    Wat(#[from] wat::Error),

    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
}

/// Assemble `wat` and build a middleware from it.
pub fn middleware(wat: &str, config: MiddlewareConfig) -> Result<Middleware, TestError> {
    let wasm = wat::parse_str(wat)?;
    Ok(Middleware::new(&wasm, config)?)
}
