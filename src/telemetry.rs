use crate::config::Config;
use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Config as TraceConfig, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "weather-ingest";
const DEFAULT_FILTER: &str = "info,weather_ingest=info";

/// Installs the global subscriber: `RUST_LOG`-driven fmt output, plus span
/// export over OTLP/HTTP when `OTEL_EXPORTER_OTLP_ENDPOINT` is configured.
pub fn init(config: &Config) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let otel_layer = match config.otlp_endpoint.as_deref().and_then(traces_endpoint) {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(&endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

fn otlp_tracer(endpoint: &str) -> Result<Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .http()
        .with_endpoint(endpoint);
    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(TraceConfig::default().with_resource(resource))
        .install_batch(runtime::Tokio)
        .with_context(|| format!("failed to start OTLP exporter for {endpoint}"))
}

/// OTLP/HTTP collectors take spans on `/v1/traces`; operators usually
/// configure only the collector base URL.
fn traces_endpoint(configured: &str) -> Option<String> {
    let base = configured.trim().trim_end_matches('/');
    if base.is_empty() {
        None
    } else if base.ends_with("/v1/traces") {
        Some(base.to_string())
    } else {
        Some(format!("{base}/v1/traces"))
    }
}
