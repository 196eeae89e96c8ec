//! Observability Module - Structured Logging, Metrics, optional OpenTelemetry

pub mod health;
pub mod metrics;
pub mod tracing_setup;

use crate::config::Config;
use opentelemetry::global;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize JSON logging, metrics, and OTLP export when configured
pub fn init_observability(service_name: &str, config: &Config) -> anyhow::Result<()> {
    metrics::init_metrics(service_name)?;

    let telemetry_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = tracing_setup::init_tracer(service_name, endpoint, &config.environment)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,brokerage_core=debug"));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(telemetry_layer)
        .try_init()?;

    tracing::info!(
        service = service_name,
        otlp = config.otlp_endpoint.is_some(),
        "Observability stack initialized"
    );

    Ok(())
}

pub fn shutdown_observability() {
    tracing::info!("Shutting down observability...");
    global::shutdown_tracer_provider();
}
