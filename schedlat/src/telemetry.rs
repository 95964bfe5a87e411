//! OpenTelemetry metrics export.
//!
//! Publishes the per-cgroup averages of each collection window to an OTLP
//! collector. Export is disabled unless OTEL_EXPORTER_OTLP_ENDPOINT is set;
//! the latest window is still kept in memory either way.

use anyhow::{Context, Result};
use log::{info, warn};
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use crate::collector::CgroupLatency;

const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<SchedLatMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

/// Node label attached to every latency series.
static NODE_NAME: OnceLock<String> = OnceLock::new();

/// Latest window, read by the latency gauge callback.
static LATEST_LATENCY: OnceLock<RwLock<Vec<CgroupLatency>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

fn latest_latency() -> &'static RwLock<Vec<CgroupLatency>> {
    LATEST_LATENCY.get_or_init(|| RwLock::new(Vec::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct SchedLatMetrics {
    pub samples: Counter<u64>,
    pub delay_ns: Counter<u64>,
}

impl SchedLatMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            samples: meter
                .u64_counter("cpu_schedule_samples")
                .with_description("Number of scheduling latency samples per cgroup")
                .with_unit("samples")
                .build(),
            delay_ns: meter
                .u64_counter("cpu_schedule_delay_ns")
                .with_description("Summed scheduling latency per cgroup")
                .with_unit("ns")
                .build(),
        }
    }
}

fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

fn latency_attributes(node: Option<&str>, latency: &CgroupLatency) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("cgroup", latency.cgroup.clone())];
    if let Some(node) = node {
        attrs.push(KeyValue::new("node", node.to_string()));
    }
    if let Some(container) = &latency.container {
        attrs.push(KeyValue::new("container_id", container.container_id.clone()));
        attrs.push(KeyValue::new("container", container.container_name.clone()));
        attrs.push(KeyValue::new("pod_uid", container.pod_uid.clone()));
        attrs.push(KeyValue::new("pod", container.pod_name.clone()));
        attrs.push(KeyValue::new("namespace", container.pod_namespace.clone()));
    }
    attrs
}

/// Configures metrics export to the OTLP collector via gRPC.
/// Skips initialization if OTEL_EXPORTER_OTLP_ENDPOINT is not set.
pub fn init_metrics(node_name: Option<&str>) -> Result<()> {
    if let Some(node) = node_name {
        let _ = NODE_NAME.set(node.to_string());
    }

    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "schedlat"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("schedlat");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently attached eBPF programs")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _latency_gauge = meter
        .f64_observable_gauge("cpu_schedule_latency_avg_ns")
        .with_description("Average scheduling latency per cgroup over the last window")
        .with_unit("ns")
        .with_callback(|observer| {
            if let Ok(latencies) = latest_latency().read() {
                for latency in latencies.iter() {
                    observer.observe(
                        latency.avg_ns,
                        &latency_attributes(NODE_NAME.get().map(String::as_str), latency),
                    );
                }
            }
        })
        .build();

    let _ = METRICS.set(SchedLatMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static SchedLatMetrics> {
    METRICS.get()
}

/// Replaces the latest window and adds its totals to the counters.
pub fn record_cgroup_latencies(latencies: &[CgroupLatency]) {
    if let Some(m) = metrics() {
        for latency in latencies {
            let attrs = latency_attributes(NODE_NAME.get().map(String::as_str), latency);
            m.samples.add(latency.samples, &attrs);
            m.delay_ns.add(latency.total_delay_ns, &attrs);
        }
    }

    if let Ok(mut latest) = latest_latency().write() {
        *latest = latencies.to_vec();
    }
}

/// Last window handed to [`record_cgroup_latencies`].
#[cfg(test)]
fn latest_cgroup_latencies() -> Vec<CgroupLatency> {
    latest_latency()
        .read()
        .map(|latest| latest.clone())
        .unwrap_or_default()
}

pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider.
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
