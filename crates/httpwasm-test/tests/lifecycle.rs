//! Loading, failures, limits and observability.

use std::sync::Arc;

use parking_lot::Mutex;

use httpwasm_host::{
    DispatchStrategy, GuestLimits, LogLevel, Logger, MiddlewareConfig, MiddlewareError,
    RuntimeSettings, TrapPhase,
};
use httpwasm_telemetry::metrics::{DiscardLabels, TrapLabels};
use httpwasm_telemetry::{Telemetry, TelemetryConfig};
use httpwasm_test::exchange::respond;
use httpwasm_test::{guests, middleware, ExchangeHost, TestError};

fn load_error(wat: &str, config: MiddlewareConfig) -> MiddlewareError {
    match middleware(wat, config) {
        Err(TestError::Middleware(err)) => err,
        Err(other) => panic!("fixture does not assemble: {other}"),
        Ok(_) => panic!("guest should be rejected"),
    }
}

const HANDLERS: &str = r#"
  (func (export "handle_request") (result i64) (i64.const 0))
  (func (export "handle_response") (param i32 i32))
"#;

#[test]
fn missing_exports_are_rejected() {
    let no_memory = format!("(module {HANDLERS})");
    assert!(matches!(
        load_error(&no_memory, MiddlewareConfig::default()),
        MiddlewareError::MissingExport(name) if name == "memory"
    ));

    let no_request = r#"(module
      (memory (export "memory") 1)
      (func (export "handle_response") (param i32 i32)))"#;
    assert!(matches!(
        load_error(no_request, MiddlewareConfig::default()),
        MiddlewareError::MissingExport(name) if name == "handle_request"
    ));

    let no_response = r#"(module
      (memory (export "memory") 1)
      (func (export "handle_request") (result i64) (i64.const 0)))"#;
    assert!(matches!(
        load_error(no_response, MiddlewareConfig::default()),
        MiddlewareError::MissingExport(name) if name == "handle_response"
    ));
}

#[test]
fn wrong_handler_signature_is_rejected() {
    let wat = r#"(module
      (memory (export "memory") 1)
      (func (export "handle_request") (result i32) (i32.const 0))
      (func (export "handle_response") (param i32 i32)))"#;
    let err = load_error(wat, MiddlewareConfig::default());
    assert!(matches!(
        err,
        MiddlewareError::InvalidExportSignature { ref name, .. } if name == "handle_request"
    ));
    assert!(err.is_init_failure());
}

#[test]
fn unknown_host_function_is_rejected() {
    let wat = format!(
        r#"(module
      (import "http-handler" "get_cookie" (func (param i32 i32) (result i32)))
      (memory (export "memory") 1)
      {HANDLERS})"#
    );
    assert!(matches!(
        load_error(&wat, MiddlewareConfig::default()),
        MiddlewareError::UnknownImport { module, name } if module == "http-handler" && name == "get_cookie"
    ));
}

#[test]
fn trapping_start_function_fails_construction() {
    let wat = format!(
        r#"(module
      (memory (export "memory") 1)
      (func (export "_start") unreachable)
      {HANDLERS})"#
    );
    for strategy in [DispatchStrategy::Pooled, DispatchStrategy::OneShot] {
        let config = MiddlewareConfig::default().with_strategy(strategy);
        assert!(matches!(
            load_error(&wat, config),
            MiddlewareError::Trap {
                phase: TrapPhase::Init,
                ..
            }
        ));
    }
}

#[tokio::test]
async fn trap_fails_request_and_discards_instance() {
    let middleware = middleware(&guests::trapping(), MiddlewareConfig::default()).unwrap();
    let host = ExchangeHost::get("/")
        .with_upstream(respond(200, "upstream"))
        .into_arc();

    let err = middleware.handle(host.clone()).await.unwrap_err();

    assert!(matches!(
        err,
        MiddlewareError::Trap {
            phase: TrapPhase::Request,
            ..
        }
    ));
    assert!(err.is_guest_failure());
    assert_eq!(host.upstream_calls(), 0);
    assert_eq!(middleware.idle_instances(), 0);

    // The next request instantiates a replacement and fails the same way.
    let host = ExchangeHost::get("/").into_arc();
    assert!(middleware.handle(host).await.is_err());
}

#[tokio::test]
async fn runaway_guest_times_out() {
    let config =
        MiddlewareConfig::default().with_limits(GuestLimits::default().with_fuel(100_000));
    let middleware = middleware(&guests::spinning(), config).unwrap();

    let err = middleware
        .handle(ExchangeHost::get("/").into_arc())
        .await
        .unwrap_err();

    assert!(matches!(err, MiddlewareError::Timeout(TrapPhase::Request)));
    assert_eq!(middleware.idle_instances(), 0);
}

#[tokio::test]
async fn metrics_follow_instances_and_failures() {
    let telemetry = Telemetry::init_without_logging(TelemetryConfig::new());
    let metrics = telemetry.metrics_clone();
    let config = MiddlewareConfig::default().with_metrics(metrics.clone());
    let middleware = middleware(&guests::trapping(), config).unwrap();

    let _ = middleware.handle(ExchangeHost::get("/").into_arc()).await;

    assert_eq!(metrics.instances_created_total.get(), 1);
    assert_eq!(
        metrics
            .instances_discarded_total
            .get_or_create(&DiscardLabels {
                reason: "failed".into()
            })
            .get(),
        1
    );
    assert_eq!(
        metrics
            .guest_traps_total
            .get_or_create(&TrapLabels {
                phase: "request".into(),
                class: "unreachable code executed (likely panic)".into(),
            })
            .get(),
        1
    );

    let text = telemetry.render_prometheus();
    assert!(text.contains("httpwasm_guest_calls_total"));
    assert!(text.contains("httpwasm_instances_discarded_total"));
}

#[derive(Default)]
struct RecordingLogger {
    records: Mutex<Vec<(LogLevel, String)>>,
}

impl Logger for RecordingLogger {
    fn is_enabled(&self, level: LogLevel) -> bool {
        level >= LogLevel::Info
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.records.lock().push((level, message.to_string()));
    }
}

#[tokio::test]
async fn guest_logs_reach_the_logger() {
    let logger = Arc::new(RecordingLogger::default());

    for level in [-1, 0, 2, 7] {
        let config = MiddlewareConfig::default()
            .with_guest_config(format!("level {level}"))
            .with_logger(logger.clone());
        let middleware = middleware(&guests::logger(level), config).unwrap();
        middleware
            .handle(ExchangeHost::get("/").into_arc())
            .await
            .unwrap();
    }

    // Debug is filtered; out-of-range levels clamp to error.
    assert_eq!(
        *logger.records.lock(),
        vec![
            (LogLevel::Info, "level 0".to_string()),
            (LogLevel::Error, "level 2".to_string()),
            (LogLevel::Error, "level 7".to_string()),
        ]
    );
}

#[tokio::test]
async fn settings_file_selects_strategy_and_config() {
    let settings = RuntimeSettings::from_toml_str(
        r#"
        strategy = "one_shot"

        [limits]
        max_fuel = 100000
        "#,
    )
    .unwrap();
    let config = settings.apply(MiddlewareConfig::default());
    assert_eq!(config.strategy, DispatchStrategy::OneShot);

    let middleware = middleware(&guests::spinning(), config).unwrap();
    assert_eq!(middleware.strategy(), DispatchStrategy::OneShot);
    let err = middleware
        .handle(ExchangeHost::get("/").into_arc())
        .await
        .unwrap_err();
    assert!(matches!(err, MiddlewareError::Timeout(TrapPhase::Request)));
}

#[tokio::test]
async fn closed_middleware_refuses_requests() {
    let middleware = middleware(&guests::counter(), MiddlewareConfig::default()).unwrap();
    middleware.close();
    middleware.close();

    assert!(middleware.is_closed());
    assert_eq!(middleware.idle_instances(), 0);
    assert!(matches!(
        middleware.handle(ExchangeHost::get("/").into_arc()).await,
        Err(MiddlewareError::Closed)
    ));
}
