//! Logging, tracing and metrics setup.
//!
//! Every process logs through `tracing`. When an OTLP endpoint is
//! configured, spans, metrics and log records are also exported there,
//! tagged with the process role so server and worker signals can be told
//! apart. Without an endpoint only the fmt layer on stderr is installed.

pub mod metrics;
pub mod task;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::warn;

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

pub const ROLE_KEY: &str = "tes.role";
pub const TASK_ID_KEY: &str = "tes.task_id";

/// Which `tes` process is reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// API server, dispatcher and reconcilers.
    Server,
    /// A worker executing one task.
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Worker => "worker",
        }
    }
}

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// OTLP endpoint, e.g. `http://localhost:4317`.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub role: Role,
    /// Task a worker process is running.
    pub task_id: Option<String>,
}

impl TelemetryConfig {
    pub fn server(logging: &LoggingConfig, service_name: impl Into<String>) -> Self {
        Self {
            endpoint: logging.otel_endpoint.clone(),
            service_name: service_name.into(),
            level: logging.level.clone(),
            role: Role::Server,
            task_id: None,
        }
    }

    /// Worker processes report under `{service_name}-worker`.
    pub fn worker(logging: &LoggingConfig, service_name: &str, task_id: impl Into<String>) -> Self {
        Self {
            endpoint: logging.otel_endpoint.clone(),
            service_name: format!("{service_name}-worker"),
            level: logging.level.clone(),
            role: Role::Worker,
            task_id: Some(task_id.into()),
        }
    }

    /// Resource attached to every exported signal.
    pub fn resource(&self) -> Resource {
        use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;

        let mut attrs = vec![
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new(ROLE_KEY, self.role.as_str()),
        ];
        if let Some(host) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
            attrs.push(KeyValue::new("host.name", host));
        }
        if let Some(id) = &self.task_id {
            attrs.push(KeyValue::new(TASK_ID_KEY, id.clone()));
        }
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(attrs)
            .build()
    }
}

/// Keeps the OTLP pipelines alive; they are flushed and shut down on drop.
#[derive(Default)]
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

struct Pipelines {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl TelemetryGuard {
    /// Push out buffered signals. A worker calls this before exiting so
    /// the last task events are not lost.
    pub fn force_flush(&self) {
        let Some(p) = &self.pipelines else { return };
        if let Err(e) = p.tracer.force_flush() {
            warn!("flushing spans: {e}");
        }
        if let Err(e) = p.meter.force_flush() {
            warn!("flushing metrics: {e}");
        }
        if let Err(e) = p.logger.force_flush() {
            warn!("flushing logs: {e}");
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.pipelines.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn build_pipelines(endpoint: &str, resource: Resource) -> Result<Pipelines> {
    use opentelemetry_otlp::WithExportConfig as _;

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("span"))?;
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("metric"))?;
    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("log"))?;

    Ok(Pipelines {
        tracer: SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build(),
        meter: SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource.clone())
            .build(),
        logger: SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build(),
    })
}

/// Install the global subscriber and, with an endpoint, the OTLP
/// pipelines. Fails if a subscriber is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let init_err = |e: tracing_subscriber::util::TryInitError| {
        Error::Other(format!("failed to init tracing subscriber: {e}"))
    };

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(init_err)?;
        return Ok(TelemetryGuard::default());
    };

    let pipelines = build_pipelines(endpoint, config.resource())?;
    opentelemetry::global::set_meter_provider(pipelines.meter.clone());
    let tracer = pipelines.tracer.tracer("tes-rs");

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
            &pipelines.logger,
        ))
        .try_init()
        .map_err(init_err)?;

    Ok(TelemetryGuard {
        pipelines: Some(pipelines),
    })
}
