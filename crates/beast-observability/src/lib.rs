//! Beast Observability
//!
//! Structured logging setup, per-message metrics and health reporting for
//! Beast mailbox agents. Metrics go through the [`MetricsSink`] trait so the
//! agent core never knows which backend is active.

pub mod health;
pub mod metrics;
pub mod trace;

#[cfg(feature = "prometheus")]
pub mod exporter;

pub use health::{ComponentHealth, HealthStatus};
pub use metrics::{
    AttemptEvent, LoggingMetrics, MetricsBackend, MetricsSink, NoopMetrics, OutcomeEvent,
    OutcomeStatus,
};
pub use trace::{LogFormat, TracingConfig, init_tracing};

#[cfg(feature = "prometheus")]
pub use exporter::{metrics_router, serve_metrics};
#[cfg(feature = "prometheus")]
pub use metrics::PrometheusMetrics;

/// Standard latency buckets, in seconds
///
/// Provider calls are slow compared to in-process work, so the range runs
/// from 5ms up to two minutes.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.01,  // 10ms
    0.05,  // 50ms
    0.1,   // 100ms
    0.25,  // 250ms
    0.5,   // 500ms
    1.0,   // 1s
    2.5,   // 2.5s
    5.0,   // 5s
    10.0,  // 10s
    30.0,  // 30s
    60.0,  // 1m
    120.0, // 2m
];

/// Buckets for the number of provider calls a message needed
pub const ATTEMPT_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 4.0, 5.0, 10.0];

/// Observability framework errors
#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("Metrics initialization failed: {0}")]
    MetricsInit(String),

    #[error("Metrics encoding failed: {0}")]
    MetricsEncode(String),

    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("Metrics exporter failed: {0}")]
    Exporter(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "prometheus")]
impl From<prometheus::Error> for ObservabilityError {
    fn from(err: prometheus::Error) -> Self {
        ObservabilityError::MetricsInit(err.to_string())
    }
}
