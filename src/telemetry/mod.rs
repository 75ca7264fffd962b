//! Tracing, metrics and log export.
//!
//! Without an OTLP endpoint only a fmt layer is installed and the metric
//! instruments in [`metrics`] stay no-ops. With one, worker spans and the
//! relaybus metrics are exported; log export is opt-in since every event
//! already reaches stdout.

pub mod metrics;
pub mod worker;

use crate::error::{Error, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Name of the tracer and of the global meter.
pub const INSTRUMENTATION_NAME: &str = "relaybus";

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317".
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Also ship log events over OTLP. Ignored without an endpoint.
    pub export_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            service_name: INSTRUMENTATION_NAME.to_string(),
            log_level: "info".to_string(),
            export_logs: false,
        }
    }
}

/// Keeps the OTLP providers alive. Dropping it flushes and shuts them down.
#[derive(Default)]
pub struct TelemetryGuard {
    tracer: Option<SdkTracerProvider>,
    meter: Option<SdkMeterProvider>,
    logger: Option<SdkLoggerProvider>,
}

impl TelemetryGuard {
    /// True when spans and metrics leave the process.
    pub fn is_exporting(&self) -> bool {
        self.tracer.is_some()
    }

    /// Push buffered spans, metrics and logs to the collector now.
    pub fn flush(&self) -> Result<()> {
        let mut failures = Vec::new();
        if let Some(tracer) = &self.tracer {
            if let Err(e) = tracer.force_flush() {
                failures.push(format!("traces: {e}"));
            }
        }
        if let Some(meter) = &self.meter {
            if let Err(e) = meter.force_flush() {
                failures.push(format!("metrics: {e}"));
            }
        }
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.force_flush() {
                failures.push(format!("logs: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Other(format!("telemetry flush failed ({})", failures.join(", "))))
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first so shutdown events from the other providers are not lost.
        if let Some(logger) = self.logger.take() {
            let _ = logger.shutdown();
        }
        if let Some(meter) = self.meter.take() {
            let _ = meter.shutdown();
        }
        if let Some(tracer) = self.tracer.take() {
            let _ = tracer.shutdown();
        }
    }
}

/// Install the global subscriber. Call once, early in `main`, and hold the
/// guard until exit.
///
/// # Errors
///
/// `Error::Config` for an unparsable `log_level`; `Error::Other` if an
/// exporter cannot be built or a global subscriber is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| Error::Config(format!("invalid log level {:?}: {e}", config.log_level)))?,
    };

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard::default());
    };

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();
    let tracer = tracer_provider(endpoint, &resource)?;
    let meter = meter_provider(endpoint, &resource)?;
    opentelemetry::global::set_meter_provider(meter.clone());
    let logger = if config.export_logs {
        Some(logger_provider(endpoint, &resource)?)
    } else {
        None
    };

    let trace_layer =
        tracing_opentelemetry::layer().with_tracer(tracer.tracer(INSTRUMENTATION_NAME));
    let log_layer = logger.as_ref().map(OpenTelemetryTracingBridge::new);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(subscriber_error)?;

    tracing::info!(endpoint, export_logs = config.export_logs, "otlp export enabled");
    Ok(TelemetryGuard {
        tracer: Some(tracer),
        meter: Some(meter),
        logger,
    })
}

fn tracer_provider(endpoint: &str, resource: &Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource.clone())
        .build())
}

fn meter_provider(endpoint: &str, resource: &Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource.clone())
        .build())
}

fn logger_provider(endpoint: &str, resource: &Resource) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource.clone())
        .build())
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to build OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}
