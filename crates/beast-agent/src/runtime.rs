//! Agent runtime: wiring and lifecycle
//!
//! [`AgentRuntime`] assembles the stream, provider, context store and
//! metrics sink named by the configuration, runs the
//! [`MailboxProcessor`] on a background task and stops it with a drain.
//! Any collaborator can be swapped through [`AgentRuntimeBuilder`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beast_observability::{
    ComponentHealth, LoggingMetrics, MetricsBackend, MetricsSink, PrometheusMetrics, serve_metrics,
};
use beast_stream::{MailboxStream, RedisMailboxStream, RedisStreamConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::context::{ContextStore, create_context_store};
use crate::error::{AgentError, AgentResult};
use crate::handler::wait_for_shutdown;
use crate::processor::{MailboxProcessor, ProcessorStats, stream_health};
use crate::provider::{ProviderAdapter, create_provider};

/// Upper bound for a single health check
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for [`AgentRuntime`]
pub struct AgentRuntimeBuilder {
    config: AgentConfig,
    stream: Option<Arc<dyn MailboxStream>>,
    provider: Option<Arc<dyn ProviderAdapter>>,
    context: Option<Arc<dyn ContextStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl AgentRuntimeBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            stream: None,
            provider: None,
            context: None,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_stream(mut self, stream: Arc<dyn MailboxStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ProviderAdapter>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_context_store(mut self, context: Arc<dyn ContextStore>) -> Self {
        self.context = Some(context);
        self
    }

    /// Use `metrics` instead of the configured backend; disables the exporter
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build every collaborator not supplied explicitly
    ///
    /// No network connection is made here; an unreachable Redis shows up
    /// once the runtime starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unknown or lacks credentials, or
    /// if a connection pool or metrics registry cannot be created.
    pub fn build(self) -> AgentResult<AgentRuntime> {
        let config = self.config;

        let stream = match self.stream {
            Some(stream) => stream,
            None => Arc::new(RedisMailboxStream::from_config(
                RedisStreamConfig::new(config.redis_url.clone())
                    .with_pool_size(config.concurrency + 2)
                    .with_maxlen(config.stream_maxlen),
            )?),
        };
        let provider = match self.provider {
            Some(provider) => provider,
            None => create_provider(&config)?,
        };
        let context = match self.context {
            Some(context) => context,
            None => create_context_store(&config)?,
        };

        let mut prometheus = None;
        let metrics: Arc<dyn MetricsSink> = match (self.metrics, config.metrics_backend) {
            (Some(metrics), _) => metrics,
            (None, MetricsBackend::Logging) => {
                Arc::new(LoggingMetrics::new(config.agent_id.clone()))
            }
            (None, MetricsBackend::Prometheus) => {
                let registry = Arc::new(PrometheusMetrics::new(&config.agent_id)?);
                prometheus = Some(Arc::clone(&registry));
                registry
            }
        };

        Ok(AgentRuntime {
            config: Arc::new(config),
            stream,
            provider,
            context,
            metrics,
            prometheus,
            running: None,
        })
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    processor: JoinHandle<AgentResult<ProcessorStats>>,
    exporter: Option<JoinHandle<()>>,
}

/// A configured agent with a start/stop lifecycle
pub struct AgentRuntime {
    config: Arc<AgentConfig>,
    stream: Arc<dyn MailboxStream>,
    provider: Arc<dyn ProviderAdapter>,
    context: Arc<dyn ContextStore>,
    metrics: Arc<dyn MetricsSink>,
    prometheus: Option<Arc<PrometheusMetrics>>,
    running: Option<Running>,
}

impl AgentRuntime {
    pub fn builder(config: AgentConfig) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Prometheus registry backing `/metrics`, when that backend is active
    pub fn prometheus(&self) -> Option<&Arc<PrometheusMetrics>> {
        self.prometheus.as_ref()
    }

    /// Start polling in the background
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::AlreadyRunning`] if the runtime was started
    /// already.
    pub fn start(&mut self) -> AgentResult<()> {
        if self.running.is_some() {
            return Err(AgentError::AlreadyRunning);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let processor = MailboxProcessor::new(
            Arc::clone(&self.config),
            Arc::clone(&self.stream),
            Arc::clone(&self.provider),
            Arc::clone(&self.context),
            Arc::clone(&self.metrics),
            shutdown_rx.clone(),
        );

        info!(
            agent_id = %self.config.agent_id,
            subscription = %processor.subscription(),
            "Starting agent"
        );
        let processor = tokio::spawn(processor.run());
        let exporter = self.spawn_exporter(shutdown_rx);

        self.running = Some(Running {
            shutdown,
            processor,
            exporter,
        });
        Ok(())
    }

    fn spawn_exporter(&self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let prometheus = self.prometheus.clone()?;
        let port = self.config.metrics_port?;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        Some(tokio::spawn(async move {
            let signal = async move { wait_for_shutdown(&mut shutdown).await };
            if let Err(e) = serve_metrics(addr, prometheus, signal).await {
                error!(error = %e, "Metrics exporter stopped");
            }
        }))
    }

    /// Stop polling, drain in-flight messages and release the provider
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::NotRunning`] if the runtime is not running, or
    /// [`AgentError::Task`] if the processor task panicked.
    pub async fn stop(&mut self) -> AgentResult<ProcessorStats> {
        let running = self.running.take().ok_or(AgentError::NotRunning)?;
        info!(agent_id = %self.config.agent_id, "Stopping agent");

        // Receivers live in the tasks; a send error only means they already exited
        let _ = running.shutdown.send(true);

        let stats = running
            .processor
            .await
            .map_err(|e| AgentError::Task(e.to_string()))??;

        if let Some(exporter) = running.exporter {
            if let Err(e) = exporter.await {
                warn!(error = %e, "Metrics exporter task failed");
            }
        }
        self.provider.close().await;

        info!(?stats, "Agent stopped");
        Ok(stats)
    }

    /// Start, wait for `signal`, then stop
    ///
    /// # Errors
    ///
    /// Propagates errors from [`start`](Self::start) and [`stop`](Self::stop).
    pub async fn run_until<F>(&mut self, signal: F) -> AgentResult<ProcessorStats>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        signal.await;
        self.stop().await
    }

    /// Check the stream without consuming any message
    pub async fn health_check(&self) -> ComponentHealth {
        check_stream(self.stream.as_ref(), &self.config).await
    }
}

/// One-shot health check for the configured Redis
pub async fn perform_healthcheck(config: &AgentConfig) -> ComponentHealth {
    let stream = match RedisMailboxStream::from_config(RedisStreamConfig::new(
        config.redis_url.clone(),
    )) {
        Ok(stream) => stream,
        Err(e) => return ComponentHealth::unhealthy("mailbox_stream", e.to_string(), Duration::ZERO),
    };
    check_stream(&stream, config).await
}

async fn check_stream(stream: &dyn MailboxStream, config: &AgentConfig) -> ComponentHealth {
    let subscription = config.subscription();
    match tokio::time::timeout(HEALTHCHECK_TIMEOUT, stream_health(stream, &subscription)).await {
        Ok(health) => health,
        Err(_) => ComponentHealth::unhealthy(
            "mailbox_stream",
            format!("no answer within {}s", HEALTHCHECK_TIMEOUT.as_secs()),
            HEALTHCHECK_TIMEOUT,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beast_observability::NoopMetrics;
    use beast_stream::InMemoryMailboxStream;

    fn config() -> AgentConfig {
        AgentConfig::builder("agent-1", "redis://localhost:6379")
            .openai_api_key("sk-test")
            .poll_interval(Duration::from_millis(20))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let mut runtime = AgentRuntime::builder(config())
            .with_stream(Arc::new(InMemoryMailboxStream::new()))
            .with_metrics(Arc::new(NoopMetrics))
            .build()
            .unwrap();

        assert!(matches!(runtime.stop().await, Err(AgentError::NotRunning)));
        runtime.start().unwrap();
        assert!(runtime.is_running());
        assert!(matches!(runtime.start(), Err(AgentError::AlreadyRunning)));

        let stats = runtime.stop().await.unwrap();
        assert_eq!(stats.dispatched, 0);
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn test_prometheus_backend_builds_registry() {
        let config = AgentConfig::builder("agent-1", "redis://localhost:6379")
            .openai_api_key("sk-test")
            .metrics_backend(MetricsBackend::Prometheus)
            .build()
            .unwrap();
        let runtime = AgentRuntime::builder(config)
            .with_stream(Arc::new(InMemoryMailboxStream::new()))
            .build()
            .unwrap();
        assert!(runtime.prometheus().is_some());
    }

    #[tokio::test]
    async fn test_health_check_uses_stream() {
        let stream = InMemoryMailboxStream::new();
        let runtime = AgentRuntime::builder(config())
            .with_stream(Arc::new(stream.clone()))
            .build()
            .unwrap();

        assert!(runtime.health_check().await.is_healthy());
        stream.set_unavailable(true).await;
        assert!(!runtime.health_check().await.is_healthy());
    }

    #[test]
    fn test_build_fails_for_unknown_provider() {
        let config = AgentConfig::builder("agent-1", "redis://localhost:6379")
            .llm_provider("mystery")
            .build()
            .unwrap();
        let result = AgentRuntime::builder(config)
            .with_stream(Arc::new(InMemoryMailboxStream::new()))
            .build();
        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
