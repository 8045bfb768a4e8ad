// Structured logging
pub mod logging;

// Request metrics and sinks
pub mod metrics;

// Per-request timing record
pub mod request_metric;

// Re-export commonly used types for convenience
pub use logging::{init_logging, redact_api_key};
pub use metrics::{install_prometheus_exporter, InMemoryMetricsSink, MetricsSink, PrometheusMetricsSink};
pub use request_metric::RequestMetric;
