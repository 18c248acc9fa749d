//! Per-message metrics
//!
//! The agent emits one [`AttemptEvent`] per provider call and one
//! [`OutcomeEvent`] per handled message. Sinks decide what to do with them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::ObservabilityError;

/// Terminal status of a handled message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
    /// Processing stopped by shutdown before a terminal outcome
    Abandoned,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
            OutcomeStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptEvent {
    pub message_id: String,
    pub sender: String,
    pub provider: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub succeeded: bool,
    pub retryable: bool,
    pub error_code: Option<String>,
    pub duration: Duration,
}

/// One handled message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeEvent {
    pub message_id: String,
    pub sender: String,
    pub status: OutcomeStatus,
    pub provider: String,
    pub attempts: u32,
    pub retryable: bool,
    pub error_code: Option<String>,
    pub duration: Duration,
}

/// Destination for agent metrics
///
/// Implementations must not block; they are called inline on the message
/// path.
pub trait MetricsSink: Send + Sync {
    fn record_attempt(&self, event: &AttemptEvent);

    fn record_outcome(&self, event: &OutcomeEvent);
}

/// Which sink the agent should build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricsBackend {
    #[default]
    Logging,
    Prometheus,
}

impl FromStr for MetricsBackend {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logging" | "log" => Ok(MetricsBackend::Logging),
            "prometheus" => Ok(MetricsBackend::Prometheus),
            other => Err(ObservabilityError::Config(format!(
                "unknown metrics backend '{other}', expected logging or prometheus"
            ))),
        }
    }
}

impl fmt::Display for MetricsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricsBackend::Logging => f.write_str("logging"),
            MetricsBackend::Prometheus => f.write_str("prometheus"),
        }
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_attempt(&self, _event: &AttemptEvent) {}

    fn record_outcome(&self, _event: &OutcomeEvent) {}
}

/// Writes each event as a structured log record on target `beast::metrics`
#[derive(Debug, Clone)]
pub struct LoggingMetrics {
    agent_id: String,
}

impl LoggingMetrics {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }
}

impl MetricsSink for LoggingMetrics {
    fn record_attempt(&self, event: &AttemptEvent) {
        info!(
            target: "beast::metrics",
            agent_id = %self.agent_id,
            message_id = %event.message_id,
            sender = %event.sender,
            provider = %event.provider,
            attempt = event.attempt,
            succeeded = event.succeeded,
            retryable = event.retryable,
            error_code = event.error_code.as_deref().unwrap_or(""),
            duration_ms = event.duration.as_millis() as u64,
            "provider_attempt"
        );
    }

    fn record_outcome(&self, event: &OutcomeEvent) {
        info!(
            target: "beast::metrics",
            agent_id = %self.agent_id,
            message_id = %event.message_id,
            sender = %event.sender,
            status = %event.status,
            provider = %event.provider,
            attempts = event.attempts,
            retryable = event.retryable,
            error_code = event.error_code.as_deref().unwrap_or(""),
            duration_ms = event.duration.as_millis() as u64,
            "prompt_event"
        );
    }
}

#[cfg(feature = "prometheus")]
pub use self::prometheus_sink::PrometheusMetrics;

#[cfg(feature = "prometheus")]
mod prometheus_sink {
    use std::collections::HashMap;

    use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

    use super::{AttemptEvent, MetricsSink, OutcomeEvent};
    use crate::{ATTEMPT_BUCKETS, LATENCY_BUCKETS, ObservabilityError};

    /// Prometheus sink with its own registry
    ///
    /// Every series carries a constant `agent_id` label. Keeping the registry
    /// private lets several agents (or tests) coexist in one process.
    #[derive(Debug, Clone)]
    pub struct PrometheusMetrics {
        registry: Registry,
        prompt_events_total: CounterVec,
        prompt_duration_seconds: HistogramVec,
        prompt_attempts: HistogramVec,
        provider_attempts_total: CounterVec,
    }

    impl PrometheusMetrics {
        pub fn new(agent_id: &str) -> Result<Self, ObservabilityError> {
            let labels = HashMap::from([("agent_id".to_string(), agent_id.to_string())]);
            let registry = Registry::new_custom(None, Some(labels))?;

            let prompt_events_total = CounterVec::new(
                Opts::new("beast_prompt_events_total", "Handled messages by outcome"),
                &["status", "provider", "retryable", "error_code"],
            )?;
            let prompt_duration_seconds = HistogramVec::new(
                HistogramOpts::new(
                    "beast_prompt_duration_seconds",
                    "Time from dispatch to terminal outcome",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["status", "provider"],
            )?;
            let prompt_attempts = HistogramVec::new(
                HistogramOpts::new("beast_prompt_attempts", "Provider calls per message")
                    .buckets(ATTEMPT_BUCKETS.to_vec()),
                &["status"],
            )?;
            let provider_attempts_total = CounterVec::new(
                Opts::new("beast_provider_attempts_total", "Provider calls by result"),
                &["provider", "result"],
            )?;

            registry.register(Box::new(prompt_events_total.clone()))?;
            registry.register(Box::new(prompt_duration_seconds.clone()))?;
            registry.register(Box::new(prompt_attempts.clone()))?;
            registry.register(Box::new(provider_attempts_total.clone()))?;

            Ok(Self {
                registry,
                prompt_events_total,
                prompt_duration_seconds,
                prompt_attempts,
                provider_attempts_total,
            })
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        /// Render every series in the text exposition format
        pub fn render(&self) -> Result<String, ObservabilityError> {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            encoder
                .encode(&self.registry.gather(), &mut buffer)
                .map_err(|e| ObservabilityError::MetricsEncode(e.to_string()))?;
            String::from_utf8(buffer).map_err(|e| ObservabilityError::MetricsEncode(e.to_string()))
        }
    }

    impl MetricsSink for PrometheusMetrics {
        fn record_attempt(&self, event: &AttemptEvent) {
            let result = if event.succeeded {
                "success"
            } else if event.retryable {
                "retryable_error"
            } else {
                "fatal_error"
            };
            self.provider_attempts_total
                .with_label_values(&[event.provider.as_str(), result])
                .inc();
        }

        fn record_outcome(&self, event: &OutcomeEvent) {
            let status = event.status.as_str();
            let retryable = if event.retryable { "true" } else { "false" };
            let error_code = event.error_code.as_deref().unwrap_or("none");

            self.prompt_events_total
                .with_label_values(&[status, event.provider.as_str(), retryable, error_code])
                .inc();
            self.prompt_duration_seconds
                .with_label_values(&[status, event.provider.as_str()])
                .observe(event.duration.as_secs_f64());
            self.prompt_attempts
                .with_label_values(&[status])
                .observe(f64::from(event.attempts));
        }
    }
}
