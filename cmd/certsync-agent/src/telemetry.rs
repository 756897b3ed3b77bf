//! Logging and OpenTelemetry setup for certsync-agent
//!
//! Structured logs always go to stdout. When an OTLP endpoint is configured,
//! spans and the renewal metrics are additionally exported to the collector.
//! Without one, metric instruments record into the no-op global meter.

use anyhow::Context;
use clap::ValueEnum;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const METRICS_EXPORT_PERIOD: Duration = Duration::from_secs(60);

/// Log line format on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

type ShutdownFn = Box<dyn FnOnce() + Send>;

/// Exporters to flush before exit
#[must_use]
pub struct TelemetryGuard {
    meter_shutdown: Option<ShutdownFn>,
}

impl TelemetryGuard {
    /// Flush spans and metrics still queued for export
    pub fn shutdown(self) {
        if let Some(shutdown) = self.meter_shutdown {
            shutdown();
        }
        global::shutdown_tracer_provider();
    }
}

/// Install the global subscriber, plus the OTLP pipelines when `otlp_endpoint` is set
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_telemetry(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    format: LogFormat,
) -> anyhow::Result<TelemetryGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    let mut meter_shutdown = None;
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            let resource = Resource::new(vec![
                KeyValue::new("service.name", service_name.to_string()),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(trace::config().with_resource(resource.clone()))
                .install_batch(runtime::Tokio)
                .context("failed to install OTLP trace pipeline")?;

            meter_shutdown = Some(install_meter_provider(endpoint, resource)?);

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(TelemetryGuard { meter_shutdown })
}

/// Export every `global::meter` instrument to `endpoint`
///
/// Must run before the instruments are created.
fn install_meter_provider(endpoint: &str, resource: Resource) -> anyhow::Result<ShutdownFn> {
    let provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_resource(resource)
        .with_period(METRICS_EXPORT_PERIOD)
        .build()
        .context("failed to install OTLP metrics pipeline")?;

    global::set_meter_provider(provider.clone());

    Ok(Box::new(move || {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Failed to flush metrics");
        }
    }))
}
