use std::time::Duration;

use opentelemetry::trace::TracerProvider;
use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{self, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::constants::DEFAULT_LOG_FILTER;
use crate::util::env::{Env, LogFormat};

pub type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>;

/// Console logging, plus OTLP export when a collector endpoint is configured.
#[derive(Debug)]
pub struct Telemetry {
    log_filter: String,
    log_format: LogFormat,
    exporters: Option<Exporters>,
}

#[derive(Debug)]
struct Exporters {
    tracer_name: String,
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn new(env: &Env) -> Result<Telemetry> {
        let exporters = match env.otel_endpoint() {
            Some(collector_url) => {
                let base_resource =
                    base_attrs(env.api_service_name.clone(), env!("CARGO_PKG_VERSION"));

                Some(Exporters {
                    tracer_name: env.api_tracer_name.clone(),
                    logger_provider: build_logger_provider(collector_url, base_resource.clone())?,
                    tracer_provider: build_tracer_provider(collector_url, base_resource.clone())?,
                    meter_provider: build_meter_provider(collector_url, base_resource)?,
                })
            }
            None => None,
        };

        Ok(Self {
            log_filter: env.log_filter.clone(),
            log_format: env.log_format,
            exporters,
        })
    }

    pub fn register(self) -> Self {
        let filter = EnvFilter::try_new(&self.log_filter).unwrap_or_else(|e| {
            eprintln!("invalid LOG_FILTER '{}' ({e}), using default", self.log_filter);
            EnvFilter::new(DEFAULT_LOG_FILTER)
        });

        let trace_layer = self.exporters.as_ref().map(|ex| {
            global::set_tracer_provider(ex.tracer_provider.clone());
            let tracer = ex.tracer_provider.tracer(ex.tracer_name.clone());
            tracing_opentelemetry::layer().with_tracer(tracer)
        });
        let log_layer = self
            .exporters
            .as_ref()
            .map(|ex| OpenTelemetryTracingBridge::new(&ex.logger_provider));
        let meter_layer = self
            .exporters
            .as_ref()
            .map(|ex| tracing_opentelemetry::MetricsLayer::new(ex.meter_provider.clone()));

        let (pretty_layer, json_layer) = match self.log_format {
            LogFormat::Pretty => (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true),
                ),
                None,
            ),
            LogFormat::Json => (
                None,
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_target(true),
                ),
            ),
        };

        tracing_subscriber::registry()
            .with(trace_layer)
            .with(log_layer)
            .with(meter_layer)
            .with(filter)
            .with(pretty_layer)
            .with(json_layer)
            .init();

        if self.exporters.is_none() {
            tracing::debug!("no OTLP endpoint configured, logging to console only");
        }

        self
    }

    pub fn shutdown(self) {
        let Some(ex) = self.exporters else {
            return;
        };

        if let Err(e) = ex.meter_provider.shutdown() {
            eprintln!("error during metering shutdown: {e:?}");
        }

        if let Err(e) = ex.logger_provider.shutdown() {
            eprintln!("error during logging shutdown: {e:?}");
        }

        if let Err(e) = ex.tracer_provider.shutdown() {
            eprintln!("error during tracing shutdown: {e:?}");
        }
    }
}

fn build_logger_provider(collector_url: &str, base_resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(collector_url)
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn build_tracer_provider(collector_url: &str, base_resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(collector_url)
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn build_meter_provider(collector_url: &str, base_resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(collector_url)
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn base_attrs(name: String, version: &'static str) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", name),
            KeyValue::new("service.version", version),
        ])
        .build()
}
