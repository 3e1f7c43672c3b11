//! Logging for the tallyctl CLI
//!
//! One registry, three optional layers: human-readable lines, JSON lines (with
//! `--json`, so both streams parse) and OTLP span export (`--otel`, needs the
//! `telemetry` feature). All console output goes to stderr; stdout carries
//! command results only.
//!
//!   RUST_LOG                       # overrides the filter picked from --debug
//!   OTEL_EXPORTER_OTLP_ENDPOINT    # default: http://localhost:4317
//!   OTEL_SERVICE_NAME              # default: tallyctl

use std::io;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const QUIET: &str = "warn";
const VERBOSE: &str = "warn,tallyctl=debug,tallyctl_core=debug,sqlx=info";

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingConfig {
    pub debug: bool,
    pub otel: bool,
    /// Emit log lines as JSON objects
    pub json: bool,
}

impl TracingConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(if self.debug { VERBOSE } else { QUIET }))
    }
}

pub fn init(config: &TracingConfig) -> Result<()> {
    let text = (!config.json).then(|| {
        fmt::layer()
            .compact()
            .with_target(config.debug)
            .with_writer(io::stderr)
    });
    let json = config.json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(io::stderr)
    });

    tracing_subscriber::registry()
        .with(config.filter())
        .with(text)
        .with(json)
        .with(otel::layer(config)?)
        .try_init()
        .context("Failed to install tracing subscriber")
}

pub use otel::shutdown as shutdown_otel;

#[cfg(feature = "telemetry")]
mod otel {
    use anyhow::{anyhow, Result};
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::{Tracer, TracerProvider};
    use opentelemetry_sdk::{runtime, Resource};
    use tracing::Subscriber;
    use tracing_opentelemetry::OpenTelemetryLayer;
    use tracing_subscriber::registry::LookupSpan;

    use super::TracingConfig;

    pub fn layer<S>(config: &TracingConfig) -> Result<Option<OpenTelemetryLayer<S, Tracer>>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        if !config.otel {
            return Ok(None);
        }

        let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4317".to_string());
        let service = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "tallyctl".to_string());

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&endpoint)
            .build()
            .map_err(|e| anyhow!("Failed to create OTLP exporter for {}: {}", endpoint, e))?;
        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_resource(Resource::new(vec![KeyValue::new("service.name", service)]))
            .build();
        let tracer = provider.tracer("tallyctl");

        // Export stops when the provider is dropped
        let _ = opentelemetry::global::set_tracer_provider(provider);
        Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
    }

    /// Flush spans still queued in the batch exporter
    pub fn shutdown() {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

#[cfg(not(feature = "telemetry"))]
mod otel {
    use anyhow::Result;
    use tracing_subscriber::layer::Identity;

    use super::TracingConfig;

    pub fn layer(config: &TracingConfig) -> Result<Option<Identity>> {
        if config.otel {
            eprintln!("warning: --otel ignored, built without the `telemetry` feature");
        }
        Ok(None)
    }

    pub fn shutdown() {}
}
