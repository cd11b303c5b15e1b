//! Integration tests for telemetry initialization and span helpers.

use tes_rs::config::LoggingConfig;
use opentelemetry::{Key, Value};
use tes_rs::telemetry::{
    ROLE_KEY, Role, TASK_ID_KEY, TelemetryConfig, init_telemetry, metrics, task,
};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    let config = TelemetryConfig::server(&LoggingConfig::default(), "tes-test");
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    if let Ok(guard) = init_telemetry(config) {
        guard.force_flush();
    }
}

#[test]
fn config_follows_logging_section() {
    let logging = LoggingConfig {
        level: "warn".to_string(),
        otel_endpoint: Some("http://localhost:4317".to_string()),
    };
    let config = TelemetryConfig::server(&logging, "tes");
    assert_eq!(config.service_name, "tes");
    assert_eq!(config.role, Role::Server);
    assert_eq!(config.level, "warn");
    assert_eq!(config.endpoint.as_deref(), Some("http://localhost:4317"));
}

#[test]
fn worker_resource_names_role_and_task() {
    let config = TelemetryConfig::worker(&LoggingConfig::default(), "tes", "d2c8h0r2l0p0000000000000");
    assert_eq!(config.service_name, "tes-worker");

    let resource = config.resource();
    assert_eq!(
        resource.get(&Key::new(ROLE_KEY)),
        Some(Value::from("worker"))
    );
    assert_eq!(
        resource.get(&Key::new(TASK_ID_KEY)),
        Some(Value::from("d2c8h0r2l0p0000000000000"))
    );
    assert_eq!(
        resource.get(&Key::new("service.name")),
        Some(Value::from("tes-worker"))
    );
}

#[test]
fn server_resource_has_no_task() {
    let resource = TelemetryConfig::server(&LoggingConfig::default(), "tes").resource();
    assert_eq!(resource.get(&Key::new(ROLE_KEY)), Some(Value::from("server")));
    assert_eq!(resource.get(&Key::new(TASK_ID_KEY)), None);
}

#[test]
fn task_span_records_transition() {
    let span = task::start_task_span("d2c8h0r2l0p0000000000000", "slurm");
    task::record_state_transition(&span, "QUEUED", "INITIALIZING");
}

#[test]
fn executor_span_creates() {
    let span = task::start_executor_span("d2c8h0r2l0p0000000000000", 0, 1, "alpine");
    let _entered = span.enter();
}

#[test]
fn metric_instruments_are_usable_without_exporter() {
    metrics::tasks_created().add(1, &[]);
    metrics::executor_duration_ms().record(12.5, &[]);
}
