//! Structured logging + metrics bootstrap for the `vizql-server` host
//! binary: a `tracing` subscriber with an optional OTLP exporter, plus a
//! process-wide Prometheus recorder for the counters and gauges the rest
//! of the workspace emits.

use std::net::SocketAddr;

use opentelemetry_sdk::runtime::Tokio;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to install global tracing subscriber: {0}")]
    Subscriber(String),
    #[error("failed to install OTLP exporter: {0}")]
    Otlp(#[from] opentelemetry::trace::TraceError),
    #[error("failed to bind prometheus exporter on {0}: {1}")]
    PrometheusBind(SocketAddr, String),
}

/// Bootstrap knobs for the host binary. Every field carries a sane
/// production-safe default so a bare `TracingConfig::default()` is always
/// a valid starting point: nothing here requires an external collector
/// to be reachable before the process can start logging.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    /// `info`, `debug`, or a full `tracing_subscriber::EnvFilter` directive
    /// string (e.g. `vizql_sql=debug,info`).
    pub env_filter: String,
    /// Structured JSON log lines instead of the human-readable formatter;
    /// flip on for production deployments behind a log aggregator.
    pub json: bool,
    /// OTLP gRPC collector endpoint; tracing spans export here when set.
    pub otlp_endpoint: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "vizql".to_string(),
            env_filter: "info".to_string(),
            json: false,
            otlp_endpoint: None,
        }
    }
}

/// Installs the global `tracing` subscriber. Returns a guard; dropping it
/// flushes any pending OTLP spans. Call once, at process start, before any
/// other `tracing` call site fires.
pub fn init(config: &TracingConfig) -> Result<TracingGuard, TracingError> {
    let env_filter = EnvFilter::try_new(&config.env_filter)
        .map_err(|e| TracingError::Subscriber(e.to_string()))?;

    let fmt_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
        Box::new(tracing_subscriber::fmt::layer().json().with_target(true))
    } else {
        Box::new(tracing_subscriber::fmt::layer().with_target(true))
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => Some(build_otlp_layer(&config.service_name, endpoint)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TracingError::Subscriber(e.to_string()))?;

    Ok(TracingGuard {
        otlp_installed: config.otlp_endpoint.is_some(),
    })
}

fn build_otlp_layer<S>(
    service_name: &str,
    endpoint: &str,
) -> Result<tracing_opentelemetry::OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>, TracingError>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
            opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                service_name.to_string(),
            )]),
        ))
        .install_batch(Tokio)?;
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

pub struct TracingGuard {
    otlp_installed: bool,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if self.otlp_installed {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

/// Installs the process-wide Prometheus metrics recorder and returns a
/// render-on-demand handle for a `/metrics` endpoint, mirroring the
/// `metrics`-crate counters/gauges the rest of the workspace already emits
/// (`vizql_gateway_active_sessions`, cache hit/miss, dispatch latencies).
pub fn install_prometheus_recorder() -> Result<metrics_exporter_prometheus::PrometheusHandle, String> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| e.to_string())
}
