//! WAT guest fixtures.
//!
//! Every fixture imports the full pooled host module and gets the `$eq`
//! and `$redact` helpers; the one-shot fixtures also import
//! `await_response`. Static strings live below offset 1024 and scratch
//! buffers start at 1024.

const IMPORTS: &str = r#"
  (import "http-handler" "enable_features" (func $enable_features (param i32) (result i32)))
  (import "http-handler" "get_config" (func $get_config (param i32 i32) (result i32)))
  (import "http-handler" "log" (func $log (param i32 i32 i32)))
  (import "http-handler" "get_method" (func $get_method (param i32 i32) (result i32)))
  (import "http-handler" "set_method" (func $set_method (param i32 i32)))
  (import "http-handler" "get_uri" (func $get_uri (param i32 i32) (result i32)))
  (import "http-handler" "set_uri" (func $set_uri (param i32 i32)))
  (import "http-handler" "get_protocol_version" (func $get_protocol_version (param i32 i32) (result i32)))
  (import "http-handler" "get_header_names" (func $get_header_names (param i32 i32 i32) (result i64)))
  (import "http-handler" "get_header_values" (func $get_header_values (param i32 i32 i32 i32 i32) (result i64)))
  (import "http-handler" "set_header_value" (func $set_header_value (param i32 i32 i32 i32 i32)))
  (import "http-handler" "add_header_value" (func $add_header_value (param i32 i32 i32 i32 i32)))
  (import "http-handler" "remove_header" (func $remove_header (param i32 i32 i32)))
  (import "http-handler" "read_body" (func $read_body (param i32 i32 i32) (result i64)))
  (import "http-handler" "write_body" (func $write_body (param i32 i32 i32)))
  (import "http-handler" "get_status_code" (func $get_status_code (result i32)))
  (import "http-handler" "set_status_code" (func $set_status_code (param i32)))
"#;

const AWAIT_IMPORT: &str = r#"
  (import "http-handler" "await_response" (func $await_response (param i64) (result i32)))
"#;

const HELPERS: &str = r#"
  (func $eq (param $a i32) (param $b i32) (param $len i32) (result i32)
    (local $i i32)
    (loop $next
      (if (i32.lt_u (local.get $i) (local.get $len))
        (then
          (if (i32.ne (i32.load8_u (i32.add (local.get $a) (local.get $i)))
                      (i32.load8_u (i32.add (local.get $b) (local.get $i))))
            (then (return (i32.const 0))))
          (local.set $i (i32.add (local.get $i) (i32.const 1)))
          (br $next))))
    (i32.const 1))

  (func $redact (param $ptr i32) (param $len i32) (param $secret i32) (param $secret_len i32)
    (local $i i32)
    (if (i32.eqz (local.get $secret_len)) (then (return)))
    (block $done
      (loop $scan
        (br_if $done
          (i32.gt_u (i32.add (local.get $i) (local.get $secret_len)) (local.get $len)))
        (if (call $eq (i32.add (local.get $ptr) (local.get $i))
                      (local.get $secret)
                      (local.get $secret_len))
          (then
            (memory.fill (i32.add (local.get $ptr) (local.get $i))
                         (i32.const 35)
                         (local.get $secret_len))
            (local.set $i (i32.add (local.get $i) (local.get $secret_len))))
          (else
            (local.set $i (i32.add (local.get $i) (i32.const 1)))))
        (br $scan))))
"#;

fn pooled(body: &str) -> String {
    format!("(module\n{IMPORTS}\n  (memory (export \"memory\") 1)\n{HELPERS}\n{body})")
}

fn one_shot(body: &str) -> String {
    format!("(module\n{IMPORTS}{AWAIT_IMPORT}\n  (memory (export \"memory\") 1)\n{HELPERS}\n{body})")
}

/// Rejects requests whose `authorization` header is not exactly the guest
/// configuration with 401 and a `www-authenticate` challenge.
pub fn auth() -> String {
    pooled(
        r#"
  (data (i32.const 0) "authorization")
  (data (i32.const 32) "www-authenticate")
  (data (i32.const 64) "Basic realm=\"test\"")
  (func (export "handle_request") (result i64)
    (local $expected i32) (local $values i64)
    (local.set $expected (call $get_config (i32.const 512) (i32.const 256)))
    (local.set $values
      (call $get_header_values (i32.const 0) (i32.const 0) (i32.const 13)
                               (i32.const 1024) (i32.const 256)))
    (if (i32.and
          (i32.eq (i32.wrap_i64 (local.get $values))
                  (i32.add (local.get $expected) (i32.const 1)))
          (call $eq (i32.const 512) (i32.const 1024) (local.get $expected)))
      (then (return (i64.const 1))))
    (call $set_status_code (i32.const 401))
    (call $set_header_value (i32.const 2) (i32.const 32) (i32.const 16)
                            (i32.const 64) (i32.const 18))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// Serves `hello world` for `/`, strips a `/host` prefix and calls next
/// for everything else.
pub fn router() -> String {
    pooled(
        r#"
  (data (i32.const 0) "hello world")
  (data (i32.const 32) "/host/")
  (func (export "handle_request") (result i64)
    (local $n i32)
    (local.set $n (call $get_uri (i32.const 1024) (i32.const 256)))
    (if (i32.and (i32.eq (local.get $n) (i32.const 1))
                 (i32.eq (i32.load8_u (i32.const 1024)) (i32.const 47)))
      (then
        (call $write_body (i32.const 1) (i32.const 0) (i32.const 11))
        (return (i64.const 0))))
    (if (i32.and (i32.ge_u (local.get $n) (i32.const 6))
                 (call $eq (i32.const 1024) (i32.const 32) (i32.const 6)))
      (then
        (call $set_uri (i32.const 1029) (i32.sub (local.get $n) (i32.const 5)))))
    (i64.const 1))
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// Replaces the configured secret with `#` in both bodies.
pub fn redact() -> String {
    pooled(
        r#"
  (global $secret_len (mut i32) (i32.const 0))
  (func (export "handle_request") (result i64)
    (local $n i32)
    (drop (call $enable_features (i32.const 3)))
    (global.set $secret_len (call $get_config (i32.const 0) (i32.const 256)))
    (local.set $n
      (i32.wrap_i64 (call $read_body (i32.const 0) (i32.const 1024) (i32.const 60000))))
    (call $redact (i32.const 1024) (local.get $n) (i32.const 0) (global.get $secret_len))
    (call $write_body (i32.const 0) (i32.const 1024) (local.get $n))
    (i64.const 1))
  (func (export "handle_response") (param $ctx i32) (param $is_error i32)
    (local $n i32)
    (local.set $n
      (i32.wrap_i64 (call $read_body (i32.const 1) (i32.const 1024) (i32.const 60000))))
    (call $redact (i32.const 1024) (local.get $n) (i32.const 0) (global.get $secret_len))
    (call $write_body (i32.const 1) (i32.const 1024) (local.get $n)))
"#,
    )
}

/// Increments a module-global counter (starting at 41) per request and
/// returns it as the context, always calling next.
pub fn counter() -> String {
    pooled(
        r#"
  (global $count (mut i32) (i32.const 41))
  (func (export "handle_request") (result i64)
    (global.set $count (i32.add (global.get $count) (i32.const 1)))
    (i64.or
      (i64.shl (i64.extend_i32_u (global.get $count)) (i64.const 32))
      (i64.const 1)))
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// Sets the method to the guest configuration, then writes what
/// `get_method` returns to the response body.
pub fn method_round_trip() -> String {
    setter_round_trip("$set_method", "$get_method")
}

/// Sets the URI to the guest configuration, then writes what `get_uri`
/// returns to the response body.
pub fn uri_round_trip() -> String {
    setter_round_trip("$set_uri", "$get_uri")
}

fn setter_round_trip(setter: &str, getter: &str) -> String {
    pooled(&format!(
        r#"
  (func (export "handle_request") (result i64)
    (local $n i32)
    (local.set $n (call $get_config (i32.const 0) (i32.const 256)))
    (call {setter} (i32.const 0) (local.get $n))
    (local.set $n (call {getter} (i32.const 1024) (i32.const 256)))
    (call $write_body (i32.const 1) (i32.const 1024) (local.get $n))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#
    ))
}

/// Adds `x-v: v1` and `x-v: v2` to the request, optionally overwrites with
/// `x-v: v`, then writes the NUL-delimited values to the response body and
/// sets the status to 200 plus the value count.
pub fn header_values(overwrite: bool) -> String {
    let overwrite = if overwrite {
        "(call $set_header_value (i32.const 0) (i32.const 0) (i32.const 3) (i32.const 48) (i32.const 1))"
    } else {
        ""
    };
    pooled(&format!(
        r#"
  (data (i32.const 0) "x-v")
  (data (i32.const 16) "v1")
  (data (i32.const 32) "v2")
  (data (i32.const 48) "v")
  (func (export "handle_request") (result i64)
    (local $values i64)
    (call $add_header_value (i32.const 0) (i32.const 0) (i32.const 3) (i32.const 16) (i32.const 2))
    (call $add_header_value (i32.const 0) (i32.const 0) (i32.const 3) (i32.const 32) (i32.const 2))
    {overwrite}
    (local.set $values
      (call $get_header_values (i32.const 0) (i32.const 0) (i32.const 3)
                               (i32.const 1024) (i32.const 256)))
    (call $write_body (i32.const 1) (i32.const 1024) (i32.wrap_i64 (local.get $values)))
    (call $set_status_code
      (i32.add (i32.const 200)
               (i32.wrap_i64 (i64.shr_u (local.get $values) (i64.const 32)))))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#
    ))
}

/// Writes the NUL-delimited request header names to the response body and
/// sets the status to 200 plus the name count.
pub fn header_names() -> String {
    pooled(
        r#"
  (func (export "handle_request") (result i64)
    (local $names i64)
    (local.set $names (call $get_header_names (i32.const 0) (i32.const 1024) (i32.const 60000)))
    (call $write_body (i32.const 1) (i32.const 1024) (i32.wrap_i64 (local.get $names)))
    (call $set_status_code
      (i32.add (i32.const 200)
               (i32.wrap_i64 (i64.shr_u (local.get $names) (i64.const 32)))))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// Copies the request body to the response body in reads of at most seven
/// bytes. Traps if a read returns more than asked, or if a read after
/// end-of-stream returns anything but `(eof=1, n=0)`.
pub fn chunked_copy() -> String {
    pooled(
        r#"
  (func (export "handle_request") (result i64)
    (local $total i32) (local $result i64) (local $n i32)
    (block $eof
      (loop $read
        (local.set $result
          (call $read_body (i32.const 0)
                           (i32.add (i32.const 1024) (local.get $total))
                           (i32.const 7)))
        (local.set $n (i32.wrap_i64 (local.get $result)))
        (if (i32.gt_u (local.get $n) (i32.const 7)) (then unreachable))
        (local.set $total (i32.add (local.get $total) (local.get $n)))
        (br_if $eof (i64.ne (i64.shr_u (local.get $result) (i64.const 32)) (i64.const 0)))
        (br $read)))
    (if (i64.ne (call $read_body (i32.const 0) (i32.const 1024) (i32.const 7))
                (i64.const 0x100000000))
      (then unreachable))
    (call $write_body (i32.const 1) (i32.const 1024) (local.get $total))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// Enables `features`, calls next, and runs `call` in `handle_response`.
///
/// Static strings: `PUT` at 0, `x-v` at 16, `v` at 32.
pub fn after_next(features: u32, call: &str) -> String {
    pooled(&format!(
        r#"
  (data (i32.const 0) "PUT")
  (data (i32.const 16) "x-v")
  (data (i32.const 32) "v")
  (func (export "handle_request") (result i64)
    (drop (call $enable_features (i32.const {features})))
    (i64.const 1))
  (func (export "handle_response") (param i32 i32)
    {call})
"#
    ))
}

/// The first request enables `BUFFER_RESPONSE`, later ones enable nothing;
/// each sets the status to 200 plus its effective feature set. The start
/// function enables `BUFFER_REQUEST` middleware-wide.
pub fn feature_scopes() -> String {
    pooled(
        r#"
  (global $first (mut i32) (i32.const 1))
  (func (export "_initialize")
    (drop (call $enable_features (i32.const 1))))
  (func (export "handle_request") (result i64)
    (local $features i32)
    (local.set $features
      (call $enable_features (select (i32.const 2) (i32.const 0) (global.get $first))))
    (global.set $first (i32.const 0))
    (call $set_status_code (i32.add (i32.const 200) (local.get $features)))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// Logs the guest configuration at `level`, then answers itself.
pub fn logger(level: i32) -> String {
    pooled(&format!(
        r#"
  (func (export "handle_request") (result i64)
    (call $log (i32.const {level})
               (i32.const 0)
               (call $get_config (i32.const 0) (i32.const 256)))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#
    ))
}

/// Traps in `handle_request`.
pub fn trapping() -> String {
    pooled(
        r#"
  (func (export "handle_request") (result i64) unreachable)
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// Spins forever in `handle_request`.
pub fn spinning() -> String {
    pooled(
        r#"
  (func (export "handle_request") (result i64)
    (loop $spin (br $spin))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// Counts to ten billion, then sets status 418 and answers itself without
/// awaiting. Needs a fuel budget far above the default to finish.
pub fn spin_then_teapot() -> String {
    pooled(
        r#"
  (func (export "handle_request") (result i64)
    (local $i i64)
    (loop $spin
      (local.set $i (i64.add (local.get $i) (i64.const 1)))
      (br_if $spin (i64.lt_u (local.get $i) (i64.const 10000000000))))
    (call $set_status_code (i32.const 418))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// The first instance's start function enables `BUFFER_REQUEST`; later
/// ones try to add `TRAILERS`. Each request sets the status to 200 plus its
/// feature set and calls next.
pub fn late_start_features() -> String {
    pooled(
        r#"
  (func (export "_initialize")
    (if (i32.eqz (call $enable_features (i32.const 0)))
      (then (drop (call $enable_features (i32.const 1))))
      (else (drop (call $enable_features (i32.const 4))))))
  (func (export "handle_request") (result i64)
    (call $set_status_code
      (i32.add (i32.const 200) (call $enable_features (i32.const 0))))
    (i64.const 1))
  (func (export "handle_response") (param i32 i32))
"#,
    )
}

/// One-shot guest: sets `x-before: yes` on the request, awaits the
/// upstream with context 9, then sets `x-after: yes` on the response, or
/// status 502 if the upstream failed.
pub fn one_shot_wrap() -> String {
    one_shot(
        r#"
  (data (i32.const 0) "x-before")
  (data (i32.const 16) "x-after")
  (data (i32.const 32) "yes")
  (func (export "handle_request") (result i64)
    (drop (call $enable_features (i32.const 2)))
    (call $set_header_value (i32.const 0) (i32.const 0) (i32.const 8) (i32.const 32) (i32.const 3))
    (if (call $await_response (i64.const 0x0000000900000001))
      (then (call $set_status_code (i32.const 502)))
      (else
        (call $set_header_value (i32.const 2) (i32.const 16) (i32.const 7)
                                (i32.const 32) (i32.const 3))))
    (i64.const 0))
"#,
    )
}

/// One-shot guest that awaits and then runs `call`.
///
/// Static strings: `PUT` at 0, `x-v` at 16, `v` at 32.
pub fn one_shot_after_await(call: &str) -> String {
    one_shot(&format!(
        r#"
  (data (i32.const 0) "PUT")
  (data (i32.const 16) "x-v")
  (data (i32.const 32) "v")
  (func (export "handle_request") (result i64)
    (drop (call $await_response (i64.const 1)))
    {call}
    (i64.const 0))
"#
    ))
}

/// One-shot guest that answers with 204 without awaiting.
pub fn one_shot_no_await() -> String {
    one_shot(
        r#"
  (func (export "handle_request") (result i64)
    (call $set_status_code (i32.const 204))
    (i64.const 1))
"#,
    )
}
