// SPDX-License-Identifier: AGPL-3.0-only
//! OpenTelemetry configuration for distributed tracing.

use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    runtime::Tokio,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// OTLP endpoint URL (e.g., "http://jaeger:4317").
    pub otlp_endpoint: String,
    /// Service name for traces.
    pub service_name: String,
    /// Location identifier for resource attributes.
    pub location: Option<String>,
}

/// Initialize OpenTelemetry with an OTLP exporter, returning a tracing layer
/// to add to the subscriber.
pub fn init_telemetry<S>(
    config: &TelemetryConfig,
) -> anyhow::Result<OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let mut resource_attrs = vec![opentelemetry::KeyValue::new(
        "service.name",
        config.service_name.clone(),
    )];
    if let Some(location) = &config.location {
        resource_attrs.push(opentelemetry::KeyValue::new("location", location.clone()));
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(resource_attrs))
        .build();

    let tracer = provider.tracer("tacplus-server");
    // Registered globally so shutdown can flush pending spans later.
    opentelemetry::global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Shutdown OpenTelemetry, flushing any pending traces.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_config_carries_fields() {
        let config = TelemetryConfig {
            otlp_endpoint: "http://localhost:4317".to_string(),
            service_name: "tacplus-server".to_string(),
            location: Some("NYC01".to_string()),
        };
        assert_eq!(config.otlp_endpoint, "http://localhost:4317");
        assert_eq!(config.location.as_deref(), Some("NYC01"));
    }

    #[test]
    fn shutdown_without_init_does_not_panic() {
        shutdown_telemetry();
    }
}
