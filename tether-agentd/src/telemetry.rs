use anyhow::{Context, Result};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use std::time::Duration;
use tracing::info;

/// Agent OTLP metrics
pub struct AgentMetrics {
    pub operation_latency: Histogram<f64>,

    // Permission engine
    pub permission_evaluations: Counter<u64>,
    pub permission_denials: Counter<u64>,

    pub relay_reconnects: Counter<u64>,
    pub audit_evictions: Counter<u64>,
}

impl AgentMetrics {
    pub fn new(meter: &Meter) -> Self {
        let operation_latency = meter
            .f64_histogram("tether.operation.latency_ms")
            .with_description("Latency of executed operations in milliseconds")
            .build();

        let permission_evaluations = meter
            .u64_counter("tether.permission.evaluations")
            .with_description("Total permission evaluations")
            .build();

        let permission_denials = meter
            .u64_counter("tether.permission.denials")
            .with_description("Total permission denials")
            .build();

        let relay_reconnects = meter
            .u64_counter("tether.relay.reconnects")
            .with_description("Relay reconnect attempts")
            .build();

        let audit_evictions = meter
            .u64_counter("tether.audit.evictions")
            .with_description("Audit entries evicted from the ring buffer")
            .build();

        Self {
            operation_latency,
            permission_evaluations,
            permission_denials,
            relay_reconnects,
            audit_evictions,
        }
    }

    pub fn record_operation_latency(&self, duration_ms: f64, operation: &str, origin: &str) {
        self.operation_latency.record(
            duration_ms,
            &[
                KeyValue::new("operation", operation.to_string()),
                KeyValue::new("origin", origin.to_string()),
            ],
        );
    }

    pub fn record_permission_evaluation(&self, allowed: bool) {
        self.permission_evaluations
            .add(1, &[KeyValue::new("allowed", allowed.to_string())]);
    }

    pub fn record_permission_denial(&self, operation: &str, reason: &str) {
        self.permission_denials.add(
            1,
            &[
                KeyValue::new("operation", operation.to_string()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
    }

    pub fn record_relay_reconnect(&self) {
        self.relay_reconnects.add(1, &[]);
    }

    pub fn record_audit_eviction(&self) {
        self.audit_evictions.add(1, &[]);
    }
}

/// Initialize OTLP metrics export
pub fn init_metrics(endpoint: &str, service_name: &str) -> Result<(SdkMeterProvider, AgentMetrics)> {
    info!(endpoint, "initializing OTLP metrics");

    let export_config = opentelemetry_otlp::ExportConfig {
        endpoint: Some(endpoint.to_string()),
        timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_export_config(export_config)
        .build()
        .context("building OTLP metric exporter")?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
        exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .with_interval(Duration::from_secs(30))
    .build();

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());

    let meter = global::meter("tether-agentd");
    let metrics = AgentMetrics::new(&meter);

    Ok((provider, metrics))
}

pub fn shutdown_metrics(provider: SdkMeterProvider) -> Result<()> {
    info!("shutting down OTLP metrics");
    provider
        .shutdown()
        .context("shutting down meter provider")?;
    Ok(())
}
