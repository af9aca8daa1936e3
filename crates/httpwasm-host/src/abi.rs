//! The guest/host ABI.
//!
//! Guests import host functions from the [`HOST_MODULE`] namespace and export
//! `handle_request` / `handle_response` plus their linear memory. All
//! pointers are offsets into guest memory and all lengths are unsigned 32-bit
//! byte counts. Values wider than 32 bits are packed as `(high << 32) | low`.
//!
//! ```text
//! enable_features(features: u32) -> u32
//! get_config(buf: u32, buf_limit: u32) -> u32
//! log_enabled(level: i32) -> u32
//! log(level: i32, msg: u32, msg_len: u32)
//! get_method(buf: u32, buf_limit: u32) -> u32
//! set_method(ptr: u32, len: u32)
//! get_uri(buf: u32, buf_limit: u32) -> u32
//! set_uri(ptr: u32, len: u32)
//! get_protocol_version(buf: u32, buf_limit: u32) -> u32
//! get_header_names(kind: u32, buf: u32, buf_limit: u32) -> u64
//! get_header_values(kind: u32, name: u32, name_len: u32, buf: u32, buf_limit: u32) -> u64
//! set_header_value(kind: u32, name: u32, name_len: u32, value: u32, value_len: u32)
//! add_header_value(kind: u32, name: u32, name_len: u32, value: u32, value_len: u32)
//! remove_header(kind: u32, name: u32, name_len: u32)
//! read_body(kind: u32, buf: u32, buf_limit: u32) -> u64
//! write_body(kind: u32, buf: u32, buf_len: u32)
//! get_status_code() -> u32
//! set_status_code(code: u32)
//! get_remote_addr(buf: u32, buf_limit: u32) -> u32
//! await_response(ctx_next: u64) -> u32
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use wasmtime::{FuncType, ValType};

use crate::error::GuestFault;

/// Import namespace of the host module.
pub const HOST_MODULE: &str = "http-handler";

/// Import namespace of the POSIX subset (WASI preview1).
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Canonical name of the guest's memory export.
pub const MEMORY_EXPORT: &str = "memory";

/// Guest export names.
pub mod exports {
    /// `handle_request() -> i64`
    pub const HANDLE_REQUEST: &str = "handle_request";
    /// `handle_response(ctx: i32, is_error: i32)`
    pub const HANDLE_RESPONSE: &str = "handle_response";
    /// Reactor initialiser, run once per instance.
    pub const INITIALIZE: &str = "_initialize";
    /// Command entrypoint, run once per instance when there is no `_initialize`.
    pub const START: &str = "_start";
}

/// Host function names.
pub mod functions {
    pub const ENABLE_FEATURES: &str = "enable_features";
    pub const GET_CONFIG: &str = "get_config";
    pub const LOG_ENABLED: &str = "log_enabled";
    pub const LOG: &str = "log";
    pub const GET_METHOD: &str = "get_method";
    pub const SET_METHOD: &str = "set_method";
    pub const GET_URI: &str = "get_uri";
    pub const SET_URI: &str = "set_uri";
    pub const GET_PROTOCOL_VERSION: &str = "get_protocol_version";
    pub const GET_HEADER_NAMES: &str = "get_header_names";
    pub const GET_HEADER_VALUES: &str = "get_header_values";
    pub const SET_HEADER_VALUE: &str = "set_header_value";
    pub const ADD_HEADER_VALUE: &str = "add_header_value";
    pub const REMOVE_HEADER: &str = "remove_header";
    pub const READ_BODY: &str = "read_body";
    pub const WRITE_BODY: &str = "write_body";
    pub const GET_STATUS_CODE: &str = "get_status_code";
    pub const SET_STATUS_CODE: &str = "set_status_code";
    pub const GET_REMOTE_ADDR: &str = "get_remote_addr";
    pub const AWAIT_RESPONSE: &str = "await_response";
}

/// Core WASM value kinds used by the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmType {
    I32,
    I64,
}

impl WasmType {
    fn matches(self, ty: &ValType) -> bool {
        matches!(
            (self, ty),
            (WasmType::I32, ValType::I32) | (WasmType::I64, ValType::I64)
        )
    }
}

impl fmt::Display for WasmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WasmType::I32 => f.write_str("i32"),
            WasmType::I64 => f.write_str("i64"),
        }
    }
}

/// Signature of a host function or guest export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncSig {
    pub name: &'static str,
    pub params: &'static [WasmType],
    pub results: &'static [WasmType],
    /// Only linked for the one-shot dispatch strategy.
    pub one_shot_only: bool,
}

impl FuncSig {
    const fn new(
        name: &'static str,
        params: &'static [WasmType],
        results: &'static [WasmType],
    ) -> Self {
        Self {
            name,
            params,
            results,
            one_shot_only: false,
        }
    }

    /// Check a wasmtime function type against this signature.
    pub fn matches(&self, ty: &FuncType) -> bool {
        let params: Vec<ValType> = ty.params().collect();
        let results: Vec<ValType> = ty.results().collect();

        params.len() == self.params.len()
            && results.len() == self.results.len()
            && self.params.iter().zip(&params).all(|(a, b)| a.matches(b))
            && self.results.iter().zip(&results).all(|(a, b)| a.matches(b))
    }
}

impl fmt::Display for FuncSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |types: &[WasmType]| {
            types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "({})", join(self.params))?;
        if !self.results.is_empty() {
            write!(f, " -> {}", join(self.results))?;
        }
        Ok(())
    }
}

use WasmType::{I32, I64};

/// Signature of the guest's `handle_request` export.
pub const HANDLE_REQUEST_SIG: FuncSig = FuncSig::new(exports::HANDLE_REQUEST, &[], &[I64]);

/// Signature of the guest's `handle_response` export.
pub const HANDLE_RESPONSE_SIG: FuncSig =
    FuncSig::new(exports::HANDLE_RESPONSE, &[I32, I32], &[]);

/// Every function the host module exports.
pub const HOST_FUNCTIONS: &[FuncSig] = &[
    FuncSig::new(functions::ENABLE_FEATURES, &[I32], &[I32]),
    FuncSig::new(functions::GET_CONFIG, &[I32, I32], &[I32]),
    FuncSig::new(functions::LOG_ENABLED, &[I32], &[I32]),
    FuncSig::new(functions::LOG, &[I32, I32, I32], &[]),
    FuncSig::new(functions::GET_METHOD, &[I32, I32], &[I32]),
    FuncSig::new(functions::SET_METHOD, &[I32, I32], &[]),
    FuncSig::new(functions::GET_URI, &[I32, I32], &[I32]),
    FuncSig::new(functions::SET_URI, &[I32, I32], &[]),
    FuncSig::new(functions::GET_PROTOCOL_VERSION, &[I32, I32], &[I32]),
    FuncSig::new(functions::GET_HEADER_NAMES, &[I32, I32, I32], &[I64]),
    FuncSig::new(functions::GET_HEADER_VALUES, &[I32, I32, I32, I32, I32], &[I64]),
    FuncSig::new(functions::SET_HEADER_VALUE, &[I32, I32, I32, I32, I32], &[]),
    FuncSig::new(functions::ADD_HEADER_VALUE, &[I32, I32, I32, I32, I32], &[]),
    FuncSig::new(functions::REMOVE_HEADER, &[I32, I32, I32], &[]),
    FuncSig::new(functions::READ_BODY, &[I32, I32, I32], &[I64]),
    FuncSig::new(functions::WRITE_BODY, &[I32, I32, I32], &[]),
    FuncSig::new(functions::GET_STATUS_CODE, &[], &[I32]),
    FuncSig::new(functions::SET_STATUS_CODE, &[I32], &[]),
    FuncSig::new(functions::GET_REMOTE_ADDR, &[I32, I32], &[I32]),
    FuncSig {
        name: functions::AWAIT_RESPONSE,
        params: &[I64],
        results: &[I32],
        one_shot_only: true,
    },
];

/// Look up a host function by name.
pub fn host_function(name: &str) -> Option<&'static FuncSig> {
    HOST_FUNCTIONS.iter().find(|f| f.name == name)
}

/// Pack two 32-bit halves into the ABI's 64-bit return encoding.
pub fn pack(high: u32, low: u32) -> u64 {
    (u64::from(high) << 32) | u64::from(low)
}

/// Split a packed 64-bit value into `(high, low)`.
pub fn unpack(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// Feature flags negotiated between guest and host.
///
/// Bit positions are part of the wire contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Features(u32);

impl Features {
    /// Buffer the request body so it can be read by the guest and still
    /// reach the upstream handler.
    pub const BUFFER_REQUEST: Features = Features(1 << 0);
    /// Buffer the response so the guest can reshape it after next.
    pub const BUFFER_RESPONSE: Features = Features(1 << 1);
    /// Expose trailers.
    pub const TRAILERS: Features = Features(1 << 2);

    const NAMES: [(Features, &'static str); 3] = [
        (Features::BUFFER_REQUEST, "buffer_request"),
        (Features::BUFFER_RESPONSE, "buffer_response"),
        (Features::TRAILERS, "trailers"),
    ];

    /// No features.
    pub const fn empty() -> Self {
        Features(0)
    }

    /// Build from raw bits, keeping unknown bits.
    pub const fn from_bits(bits: u32) -> Self {
        Features(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is enabled.
    pub const fn contains(self, other: Features) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// This set with `other` also enabled.
    pub const fn with(self, other: Features) -> Self {
        Features(self.0 | other.0)
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        self.with(rhs)
    }
}

impl BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Features) {
        *self = self.with(rhs);
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Features::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Guest log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug = -1,
    Info = 0,
    Warn = 1,
    Error = 2,
}

impl LogLevel {
    /// Decode a guest level, clamping out-of-range values.
    pub fn from_raw(level: i32) -> Self {
        match level {
            i32::MIN..=-1 => LogLevel::Debug,
            0 => LogLevel::Info,
            1 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Which header or trailer map an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderKind {
    RequestHeaders = 0,
    RequestTrailers = 1,
    ResponseHeaders = 2,
    ResponseTrailers = 3,
}

impl HeaderKind {
    /// True for the two request-side kinds.
    pub fn is_request(self) -> bool {
        matches!(self, HeaderKind::RequestHeaders | HeaderKind::RequestTrailers)
    }
}

impl TryFrom<u32> for HeaderKind {
    type Error = GuestFault;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(HeaderKind::RequestHeaders),
            1 => Ok(HeaderKind::RequestTrailers),
            2 => Ok(HeaderKind::ResponseHeaders),
            3 => Ok(HeaderKind::ResponseTrailers),
            other => Err(GuestFault::UnknownHeaderKind(other)),
        }
    }
}

impl fmt::Display for HeaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeaderKind::RequestHeaders => "request headers",
            HeaderKind::RequestTrailers => "request trailers",
            HeaderKind::ResponseHeaders => "response headers",
            HeaderKind::ResponseTrailers => "response trailers",
        };
        f.write_str(name)
    }
}

/// Which body an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyKind {
    Request = 0,
    Response = 1,
}

impl TryFrom<u32> for BodyKind {
    type Error = GuestFault;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(BodyKind::Request),
            1 => Ok(BodyKind::Response),
            other => Err(GuestFault::UnknownBodyKind(other)),
        }
    }
}

impl fmt::Display for BodyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyKind::Request => f.write_str("request body"),
            BodyKind::Response => f.write_str("response body"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_bits_are_stable() {
        assert_eq!(Features::BUFFER_REQUEST.bits(), 1);
        assert_eq!(Features::BUFFER_RESPONSE.bits(), 2);
        assert_eq!(Features::TRAILERS.bits(), 4);
    }

    #[test]
    fn feature_set_operations() {
        let features = Features::BUFFER_REQUEST | Features::TRAILERS;
        assert!(features.contains(Features::BUFFER_REQUEST));
        assert!(features.contains(Features::TRAILERS));
        assert!(!features.contains(Features::BUFFER_RESPONSE));
        assert!(!features.contains(Features::empty()));
        assert_eq!(features.to_string(), "buffer_request|trailers");
        assert_eq!(Features::empty().to_string(), "none");
    }

    #[test]
    fn pack_and_unpack() {
        let packed = pack(42, 1);
        assert_eq!(packed, (42u64 << 32) | 1);
        assert_eq!(unpack(packed), (42, 1));
        assert_eq!(unpack(u64::MAX), (u32::MAX, u32::MAX));
    }

    #[test]
    fn log_level_clamps() {
        assert_eq!(LogLevel::from_raw(-1), LogLevel::Debug);
        assert_eq!(LogLevel::from_raw(-7), LogLevel::Debug);
        assert_eq!(LogLevel::from_raw(0), LogLevel::Info);
        assert_eq!(LogLevel::from_raw(1), LogLevel::Warn);
        assert_eq!(LogLevel::from_raw(2), LogLevel::Error);
        assert_eq!(LogLevel::from_raw(99), LogLevel::Error);
        assert_eq!(LogLevel::Debug.as_raw(), -1);
    }

    #[test]
    fn header_kind_decoding() {
        assert_eq!(HeaderKind::try_from(0), Ok(HeaderKind::RequestHeaders));
        assert_eq!(HeaderKind::try_from(3), Ok(HeaderKind::ResponseTrailers));
        assert_eq!(
            HeaderKind::try_from(4),
            Err(GuestFault::UnknownHeaderKind(4))
        );
        assert!(HeaderKind::RequestTrailers.is_request());
        assert!(!HeaderKind::ResponseHeaders.is_request());
    }

    #[test]
    fn body_kind_decoding() {
        assert_eq!(BodyKind::try_from(1), Ok(BodyKind::Response));
        assert_eq!(BodyKind::try_from(2), Err(GuestFault::UnknownBodyKind(2)));
    }

    #[test]
    fn host_function_table() {
        let read_body = host_function(functions::READ_BODY).unwrap();
        assert_eq!(read_body.to_string(), "(i32, i32, i32) -> i64");
        assert!(host_function(functions::AWAIT_RESPONSE).unwrap().one_shot_only);
        assert!(host_function("host_log").is_none());
        assert_eq!(HANDLE_RESPONSE_SIG.to_string(), "(i32, i32)");
    }
}
