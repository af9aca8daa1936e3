//! Host functions exported to the guest under [`HOST_MODULE`].
//!
//! Every thunk resolves the request in scope, decodes its parameters, checks
//! the mutation window, reads guest memory and then calls the embedder's
//! [`Host`](crate::Host). ABI violations trap the guest with a [`GuestFault`];
//! embedder failures trap it with the [`HostError`]. The dispatch core
//! recovers both by downcasting.

use std::io::Write;

use wasmtime::{Caller, Linker, Memory};

use crate::abi::{
    functions, pack, unpack, BodyKind, Features, HeaderKind, LogLevel, HOST_MODULE,
};
use crate::config::DispatchStrategy;
use crate::error::{Aborted, GuestFault, HostError, MiddlewareError, Target};
use crate::instance::GuestState;
use crate::memory::{read_bytes, read_string, slice_mut, write_if_under_limit, write_nul_terminated};
use crate::state::RequestState;

/// Either failure a thunk can raise.
enum BridgeError {
    Fault(GuestFault),
    Host(HostError),
}

impl BridgeError {
    fn into_trap(self) -> wasmtime::Error {
        match self {
            BridgeError::Fault(fault) => wasmtime::Error::new(fault),
            BridgeError::Host(err) => wasmtime::Error::new(err),
        }
    }
}

impl From<GuestFault> for BridgeError {
    fn from(fault: GuestFault) -> Self {
        BridgeError::Fault(fault)
    }
}

impl From<HostError> for BridgeError {
    fn from(err: HostError) -> Self {
        BridgeError::Host(err)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Host(HostError::Io(err))
    }
}

type Result<T> = std::result::Result<T, BridgeError>;

fn fault(fault: GuestFault) -> wasmtime::Error {
    wasmtime::Error::new(fault)
}

fn memory(caller: &Caller<'_, GuestState>) -> wasmtime::Result<Memory> {
    caller
        .data()
        .memory
        .ok_or_else(|| fault(GuestFault::MissingMemory))
}

/// Trap with [`Aborted`] once the request's caller has gone away, so a
/// cancelled guest cannot touch the exchange again.
fn ensure_live(caller: &Caller<'_, GuestState>) -> wasmtime::Result<()> {
    if caller.data().is_aborted() {
        return Err(wasmtime::Error::new(Aborted));
    }
    Ok(())
}

/// Run `f` against guest memory and the request in scope.
fn with_request<R>(
    caller: &mut Caller<'_, GuestState>,
    op: &'static str,
    f: impl FnOnce(&mut [u8], &mut RequestState) -> Result<R>,
) -> wasmtime::Result<R> {
    ensure_live(caller)?;
    let memory = memory(caller)?;
    let (data, state) = memory.data_and_store_mut(caller);
    let request = state
        .request
        .as_mut()
        .ok_or_else(|| fault(GuestFault::OutsideRequest(op)))?;
    f(data, request).map_err(BridgeError::into_trap)
}

/// Run `f` against the request in scope, without touching memory.
fn with_state<R>(
    caller: &mut Caller<'_, GuestState>,
    op: &'static str,
    f: impl FnOnce(&mut RequestState) -> Result<R>,
) -> wasmtime::Result<R> {
    ensure_live(caller)?;
    let request = caller
        .data_mut()
        .request
        .as_mut()
        .ok_or_else(|| fault(GuestFault::OutsideRequest(op)))?;
    f(request).map_err(BridgeError::into_trap)
}

/// Header mutations on the request side close at next; response-side ones
/// stay open only with response buffering.
fn check_header_window(
    request: &RequestState,
    kind: HeaderKind,
    op: &'static str,
) -> std::result::Result<(), GuestFault> {
    let target = Target::Header(kind);
    if kind.is_request() {
        request.must_be_before_next(op, target)
    } else {
        request.must_be_before_next_or_feature(Features::BUFFER_RESPONSE, op, target)
    }
}

fn header_name(data: &[u8], name: u32, name_len: u32) -> Result<String> {
    if name_len == 0 {
        return Err(GuestFault::EmptyHeaderName.into());
    }
    Ok(read_string(data, name, name_len, "header name")?)
}

/// Register every host function on `linker`.
///
/// `await_response` is only linked for the one-shot strategy.
pub(crate) fn add_to_linker(
    linker: &mut Linker<GuestState>,
    strategy: DispatchStrategy,
) -> std::result::Result<(), MiddlewareError> {
    add_functions(linker, strategy).map_err(|e| {
        MiddlewareError::Instantiation(format!("failed to define host module: {e}"))
    })
}

fn add_functions(
    linker: &mut Linker<GuestState>,
    strategy: DispatchStrategy,
) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        functions::ENABLE_FEATURES,
        |mut caller: Caller<'_, GuestState>, features: u32| -> wasmtime::Result<u32> {
            ensure_live(&caller)?;
            let requested = Features::from_bits(features);
            let state = caller.data_mut();
            let enabled = match state.request.as_mut() {
                Some(request) => {
                    let enabled = request
                        .host()
                        .enable_features(request.features() | requested);
                    request.set_features(enabled);
                    enabled
                }
                None => state.shared.enable_features(requested),
            };
            Ok(enabled.bits())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::GET_CONFIG,
        |mut caller: Caller<'_, GuestState>, buf: u32, buf_limit: u32| -> wasmtime::Result<u32> {
            ensure_live(&caller)?;
            let memory = memory(&caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            write_if_under_limit(data, buf, buf_limit, &state.shared.guest_config).map_err(fault)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::LOG_ENABLED,
        |caller: Caller<'_, GuestState>, level: i32| -> wasmtime::Result<u32> {
            ensure_live(&caller)?;
            let enabled = caller.data().shared.logger.is_enabled(LogLevel::from_raw(level));
            Ok(u32::from(enabled))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::LOG,
        |caller: Caller<'_, GuestState>,
         level: i32,
         msg: u32,
         msg_len: u32|
         -> wasmtime::Result<()> {
            ensure_live(&caller)?;
            let level = LogLevel::from_raw(level);
            let logger = caller.data().shared.logger.clone();
            if !logger.is_enabled(level) {
                return Ok(());
            }
            let memory = memory(&caller)?;
            let bytes = read_bytes(memory.data(&caller), msg, msg_len).map_err(fault)?;
            logger.log(level, &String::from_utf8_lossy(bytes));
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::GET_METHOD,
        |mut caller: Caller<'_, GuestState>, buf: u32, buf_limit: u32| {
            with_request(&mut caller, functions::GET_METHOD, |data, request| {
                let method = request.host().method();
                Ok(write_if_under_limit(data, buf, buf_limit, method.as_bytes())?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::SET_METHOD,
        |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| {
            with_request(&mut caller, functions::SET_METHOD, |data, request| {
                request.must_be_before_next("set", Target::Method)?;
                let method = read_string(data, ptr, len, "method")?;
                Ok(request.host().set_method(&method)?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::GET_URI,
        |mut caller: Caller<'_, GuestState>, buf: u32, buf_limit: u32| {
            with_request(&mut caller, functions::GET_URI, |data, request| {
                let uri = request.host().uri();
                Ok(write_if_under_limit(data, buf, buf_limit, uri.as_bytes())?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::SET_URI,
        |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| {
            with_request(&mut caller, functions::SET_URI, |data, request| {
                request.must_be_before_next("set", Target::Uri)?;
                let uri = read_string(data, ptr, len, "uri")?;
                Ok(request.host().set_uri(&uri)?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::GET_PROTOCOL_VERSION,
        |mut caller: Caller<'_, GuestState>, buf: u32, buf_limit: u32| {
            with_request(&mut caller, functions::GET_PROTOCOL_VERSION, |data, request| {
                let version = request.host().protocol_version();
                Ok(write_if_under_limit(data, buf, buf_limit, version.as_bytes())?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::GET_HEADER_NAMES,
        |mut caller: Caller<'_, GuestState>, kind: u32, buf: u32, buf_limit: u32| {
            with_request(&mut caller, functions::GET_HEADER_NAMES, |data, request| {
                let kind = HeaderKind::try_from(kind)?;
                let names: Vec<String> = request
                    .host()
                    .header_names(kind)
                    .into_iter()
                    .map(|name| name.to_ascii_lowercase())
                    .collect();
                Ok(write_nul_terminated(data, buf, buf_limit, &names)?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::GET_HEADER_VALUES,
        |mut caller: Caller<'_, GuestState>,
         kind: u32,
         name: u32,
         name_len: u32,
         buf: u32,
         buf_limit: u32| {
            with_request(&mut caller, functions::GET_HEADER_VALUES, |data, request| {
                let kind = HeaderKind::try_from(kind)?;
                let name = header_name(data, name, name_len)?;
                let values = request.host().header_values(kind, &name);
                Ok(write_nul_terminated(data, buf, buf_limit, &values)?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::SET_HEADER_VALUE,
        |mut caller: Caller<'_, GuestState>,
         kind: u32,
         name: u32,
         name_len: u32,
         value: u32,
         value_len: u32| {
            with_request(&mut caller, functions::SET_HEADER_VALUE, |data, request| {
                let kind = HeaderKind::try_from(kind)?;
                let name = header_name(data, name, name_len)?;
                check_header_window(request, kind, "set")?;
                let value = read_string(data, value, value_len, "header value")?;
                Ok(request.host().set_header_value(kind, &name, &value)?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::ADD_HEADER_VALUE,
        |mut caller: Caller<'_, GuestState>,
         kind: u32,
         name: u32,
         name_len: u32,
         value: u32,
         value_len: u32| {
            with_request(&mut caller, functions::ADD_HEADER_VALUE, |data, request| {
                let kind = HeaderKind::try_from(kind)?;
                let name = header_name(data, name, name_len)?;
                check_header_window(request, kind, "add")?;
                let value = read_string(data, value, value_len, "header value")?;
                Ok(request.host().add_header_value(kind, &name, &value)?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::REMOVE_HEADER,
        |mut caller: Caller<'_, GuestState>, kind: u32, name: u32, name_len: u32| {
            with_request(&mut caller, functions::REMOVE_HEADER, |data, request| {
                let kind = HeaderKind::try_from(kind)?;
                let name = header_name(data, name, name_len)?;
                check_header_window(request, kind, "remove")?;
                Ok(request.host().remove_header(kind, &name)?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::READ_BODY,
        |mut caller: Caller<'_, GuestState>, kind: u32, buf: u32, buf_limit: u32| {
            with_request(&mut caller, functions::READ_BODY, |data, request| {
                if buf_limit == 0 {
                    return Err(GuestFault::ZeroBufferLimit.into());
                }
                let kind = BodyKind::try_from(kind)?;
                if kind == BodyKind::Response {
                    request.must_be_before_next_or_feature(
                        Features::BUFFER_RESPONSE,
                        "read",
                        Target::Body(kind),
                    )?;
                }
                let out = slice_mut(data, buf, buf_limit)?;
                let (n, eof) = request.reader(kind)?.fill(out)?;
                // n <= buf_limit, so it fits.
                Ok(pack(u32::from(eof), n as u32))
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::WRITE_BODY,
        |mut caller: Caller<'_, GuestState>, kind: u32, buf: u32, buf_len: u32| {
            with_request(&mut caller, functions::WRITE_BODY, |data, request| {
                let kind = BodyKind::try_from(kind)?;
                match kind {
                    BodyKind::Request => request.must_be_before_next("write", Target::Body(kind))?,
                    BodyKind::Response => request.must_be_before_next_or_feature(
                        Features::BUFFER_RESPONSE,
                        "write",
                        Target::Body(kind),
                    )?,
                }
                let bytes = read_bytes(data, buf, buf_len)?;
                // Opening the writer truncates the body.
                let writer = request.writer(kind)?;
                if !bytes.is_empty() {
                    writer.write_all(bytes)?;
                }
                Ok(())
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::GET_STATUS_CODE,
        |mut caller: Caller<'_, GuestState>| {
            with_state(&mut caller, functions::GET_STATUS_CODE, |request| {
                Ok(request.host().status_code())
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::SET_STATUS_CODE,
        |mut caller: Caller<'_, GuestState>, code: u32| {
            with_state(&mut caller, functions::SET_STATUS_CODE, |request| {
                request.must_be_before_next_or_feature(
                    Features::BUFFER_RESPONSE,
                    "set",
                    Target::StatusCode,
                )?;
                Ok(request.host().set_status_code(code)?)
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        functions::GET_REMOTE_ADDR,
        |mut caller: Caller<'_, GuestState>, buf: u32, buf_limit: u32| {
            with_request(&mut caller, functions::GET_REMOTE_ADDR, |data, request| {
                let addr = request.host().remote_addr();
                Ok(write_if_under_limit(data, buf, buf_limit, addr.as_bytes())?)
            })
        },
    )?;

    if strategy == DispatchStrategy::OneShot {
        linker.func_wrap(
            HOST_MODULE,
            functions::AWAIT_RESPONSE,
            |mut caller: Caller<'_, GuestState>, ctx_next: u64| -> wasmtime::Result<u32> {
                ensure_live(&caller)?;
                let request = caller
                    .data_mut()
                    .request
                    .as_mut()
                    .ok_or_else(|| fault(GuestFault::OutsideRequest(functions::AWAIT_RESPONSE)))?;
                let rendezvous = request
                    .take_rendezvous()
                    .ok_or_else(|| fault(GuestFault::AwaitTwice))?;

                let (_, next) = unpack(ctx_next);
                // Blocks this guest thread until the upstream has run.
                match rendezvous.await_response(ctx_next) {
                    Ok(_) if next == 0 => Ok(0),
                    Ok(is_error) => {
                        request.begin_response();
                        Ok(u32::from(is_error))
                    }
                    Err(Aborted) => Err(wasmtime::Error::new(Aborted)),
                }
            },
        )?;
    }

    Ok(())
}
