//! # Request Metrics
//!
//! One [`RequestMetric`] is produced per completed proxied call and handed to
//! a [`MetricsSink`]. Sinks must not block; the data path calls them inline.

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::request_metric::RequestMetric;
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::Mutex;
use std::net::SocketAddr;
use tracing::info;

/// Consumer of per-request metrics
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: RequestMetric);
}

/// Publishes metrics through the `metrics` facade
///
/// Counters and histograms are labelled by service coordinates and outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetricsSink;

impl PrometheusMetricsSink {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn record(&self, metric: RequestMetric) {
        let labels = [
            ("service_org_id", metric.service_org_id.clone()),
            ("service_id", metric.service_id.clone()),
            ("service_version", metric.service_version.clone()),
            ("outcome", metric.outcome().to_string()),
        ];

        metrics::counter!("gateway_requests_total", &labels).increment(1);
        if metric.request_duration() >= 0 {
            metrics::histogram!("gateway_request_duration_ms", &labels).record(metric.request_duration() as f64);
        }
        if metric.service_duration() >= 0 {
            metrics::histogram!("gateway_service_duration_ms", &labels).record(metric.service_duration() as f64);
        }
        metrics::counter!("gateway_bytes_uploaded_total", &labels).increment(metric.bytes_uploaded);
        metrics::counter!("gateway_bytes_downloaded_total", &labels).increment(metric.bytes_downloaded);
    }
}

/// Keeps every metric in memory for later inspection
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    metrics: Mutex<Vec<RequestMetric>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> Vec<RequestMetric> {
        self.metrics.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.lock().is_empty()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, metric: RequestMetric) {
        self.metrics.lock().push(metric);
    }
}

/// Install the global Prometheus recorder with an HTTP scrape endpoint
///
/// Must be called from within a tokio runtime.
pub fn install_prometheus_exporter(address: SocketAddr) -> GatewayResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| GatewayError::config(format!("Failed to install Prometheus exporter: {}", e)))?;

    info!(%address, "Prometheus metrics exporter listening");
    Ok(())
}
