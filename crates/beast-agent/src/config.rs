//! Agent configuration
//!
//! Configuration is assembled by [`AgentConfigBuilder`], either
//! programmatically or from `BEAST_*` environment variables, and validated
//! once in [`AgentConfigBuilder::build`]. The resulting [`AgentConfig`] is
//! immutable and shared by every component.
//!
//! ## Environment Variables
//!
//! ### Identity and transport
//! - `BEAST_AGENT_ID` - Agent identifier (required)
//! - `BEAST_REDIS_URL` - `redis://` or `rediss://` URL (required)
//! - `BEAST_STREAM_PREFIX` - Prefix for inbox streams (default: "beast:mailbox")
//! - `BEAST_MAILBOX_STREAM` - Inbound stream (default: "{prefix}:{agent_id}:in")
//! - `BEAST_MAILBOX_GROUP` - Consumer group (default: "agent:{agent_id}")
//! - `BEAST_CONSUMER_NAME` - Consumer name within the group (default: agent id)
//! - `BEAST_REPLY_STREAM` - Send every response here instead of the sender's inbox
//!
//! ### Provider
//! - `BEAST_LLM_PROVIDER` - Provider name (default: "openai")
//! - `BEAST_OPENAI_API_KEY` - API key (required for the openai provider)
//! - `BEAST_OPENAI_BASE_URL` - API root (default: "https://api.openai.com/v1")
//! - `BEAST_MODEL_NAME` - Default model (default: "gpt-4o-mini")
//! - `BEAST_MAX_TOKENS` - Default completion limit (default: 512)
//! - `BEAST_TEMPERATURE` - Default temperature (default: 0.2)
//! - `BEAST_REQUEST_TIMEOUT` - Seconds per provider call (default: 60)
//!
//! ### Processing
//! - `BEAST_CONCURRENCY` - Messages handled at once (default: 1)
//! - `BEAST_RETRY_MAX` - Provider calls per message (default: 3)
//! - `BEAST_RETRY_BACKOFF_BASE` - First retry delay in seconds (default: 1.0)
//! - `BEAST_RETRY_BACKOFF_MAX` - Retry delay cap in seconds (default: 30.0)
//! - `BEAST_RETRY_JITTER` - Relative jitter (default: 0.1)
//! - `BEAST_POLL_INTERVAL` - Seconds to wait on an empty read (default: 1.0)
//! - `BEAST_READ_BATCH_SIZE` - Entries per read (default: 10)
//! - `BEAST_CLAIM_MIN_IDLE` - Idle seconds before a pending entry is reclaimed (default: 0)
//! - `BEAST_STREAM_MAXLEN` - Approximate length cap for reply streams (default: 1000)
//! - `BEAST_STREAM_BACKOFF_BASE` / `BEAST_STREAM_BACKOFF_MAX` - Reconnect backoff (default: 0.5 / 30.0)
//! - `BEAST_SHUTDOWN_GRACE` - Seconds to wait for in-flight messages on stop (default: 30.0)
//!
//! ### Conversation context
//! - `BEAST_CONTEXT_ENABLED` - Persist thread history (default: false)
//! - `BEAST_CONTEXT_TTL` - Seconds to keep history, 0 for no expiry (default: 900)
//! - `BEAST_CONTEXT_PREFIX` - Key prefix (default: "beast:agent:{agent_id}:context")
//! - `BEAST_CONTEXT_REDIS_URL` - Store URL (default: `BEAST_REDIS_URL`)
//! - `BEAST_CONTEXT_MAX_MESSAGES` - Turns kept per thread (default: 50)
//!
//! ### Observability
//! - `BEAST_METRICS_BACKEND` - `logging` or `prometheus` (default: logging)
//! - `BEAST_METRICS_PORT` - Port for the `/metrics` endpoint
//! - `BEAST_LOG_LEVEL` - Log level or filter directive (default: info)
//! - `BEAST_LOG_FORMAT` - `json` or `pretty` (default: json)

use std::{env, fmt, time::Duration};

use beast_observability::{LogFormat, MetricsBackend};
use beast_stream::{IdValidationError, StreamKey, Subscription};

use crate::message::{GenerationOptions, RequestOptions};
use crate::retry::RetryPolicy;

pub const DEFAULT_STREAM_PREFIX: &str = "beast:mailbox";
pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable '{0}'")]
    MissingEnvVar(String),

    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// API key that never shows up in logs
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Process-wide generation defaults, overridable per message
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub request_timeout: Duration,
}

/// Conversation history persistence
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSettings {
    pub enabled: bool,
    /// `None` keeps history until overwritten
    pub ttl: Option<Duration>,
    pub prefix: String,
    pub redis_url: String,
    pub max_messages: usize,
}

/// Validated agent configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub agent_id: String,
    pub redis_url: String,
    pub stream_prefix: String,
    pub mailbox_stream: StreamKey,
    pub mailbox_group: String,
    pub consumer_name: String,
    pub reply_stream: Option<StreamKey>,

    pub llm_provider: String,
    pub openai_api_key: Option<ApiKey>,
    pub openai_base_url: String,
    pub generation: GenerationDefaults,

    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub read_batch_size: usize,
    pub claim_min_idle: Duration,
    pub stream_maxlen: usize,
    pub stream_backoff: RetryPolicy,
    pub shutdown_grace: Duration,

    pub context: ContextSettings,

    pub metrics_backend: MetricsBackend,
    pub metrics_port: Option<u16>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl AgentConfig {
    /// Load and validate configuration from the environment
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing, a value does
    /// not parse, or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        AgentConfigBuilder::from_env()?.build()
    }

    pub fn builder(agent_id: impl Into<String>, redis_url: impl Into<String>) -> AgentConfigBuilder {
        AgentConfigBuilder::new(agent_id, redis_url)
    }

    /// Where this agent reads its requests
    pub fn subscription(&self) -> Subscription {
        Subscription {
            stream: self.mailbox_stream.clone(),
            group: self.mailbox_group.clone(),
            consumer: self.consumer_name.clone(),
        }
    }

    /// Stream a response to `sender` is published on
    pub fn reply_target(&self, sender: &str) -> Result<StreamKey, IdValidationError> {
        match &self.reply_stream {
            Some(stream) => Ok(stream.clone()),
            None => StreamKey::inbox(&self.stream_prefix, sender),
        }
    }

    /// Context store key for a conversation thread
    pub fn context_key(&self, thread_id: &str) -> String {
        format!("{}:{}", self.agent_id, thread_id)
    }

    /// Per-message overrides laid over the process defaults
    ///
    /// Absent overrides never replace a default.
    pub fn merged_options(&self, overrides: &RequestOptions) -> GenerationOptions {
        GenerationOptions {
            model: overrides
                .model
                .clone()
                .unwrap_or_else(|| self.generation.model.clone()),
            temperature: overrides.temperature.unwrap_or(self.generation.temperature),
            max_tokens: overrides.max_tokens.unwrap_or(self.generation.max_tokens),
            timeout: overrides
                .timeout
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or(self.generation.request_timeout),
        }
    }
}

/// Builder for [`AgentConfig`] with environment variable support
#[derive(Debug, Clone)]
pub struct AgentConfigBuilder {
    agent_id: String,
    redis_url: String,
    stream_prefix: String,
    mailbox_stream: Option<String>,
    mailbox_group: Option<String>,
    consumer_name: Option<String>,
    reply_stream: Option<String>,
    llm_provider: String,
    openai_api_key: Option<String>,
    openai_base_url: String,
    model_name: String,
    max_tokens: u32,
    temperature: f64,
    request_timeout_secs: f64,
    concurrency: usize,
    retry_max: u32,
    retry_backoff_base_secs: f64,
    retry_backoff_max_secs: f64,
    retry_jitter: f64,
    poll_interval_secs: f64,
    read_batch_size: usize,
    claim_min_idle_secs: f64,
    stream_maxlen: usize,
    stream_backoff_base_secs: f64,
    stream_backoff_max_secs: f64,
    shutdown_grace_secs: f64,
    context_enabled: bool,
    context_ttl_secs: u64,
    context_prefix: Option<String>,
    context_redis_url: Option<String>,
    context_max_messages: usize,
    metrics_backend: MetricsBackend,
    metrics_port: Option<u16>,
    log_level: String,
    log_format: LogFormat,
}

impl AgentConfigBuilder {
    /// Create a builder with default values for everything optional
    #[must_use]
    pub fn new(agent_id: impl Into<String>, redis_url: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            redis_url: redis_url.into(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            mailbox_stream: None,
            mailbox_group: None,
            consumer_name: None,
            reply_stream: None,
            llm_provider: DEFAULT_PROVIDER.to_string(),
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model_name: DEFAULT_MODEL.to_string(),
            max_tokens: 512,
            temperature: 0.2,
            request_timeout_secs: 60.0,
            concurrency: 1,
            retry_max: 3,
            retry_backoff_base_secs: 1.0,
            retry_backoff_max_secs: 30.0,
            retry_jitter: 0.1,
            poll_interval_secs: 1.0,
            read_batch_size: 10,
            claim_min_idle_secs: 0.0,
            stream_maxlen: 1000,
            stream_backoff_base_secs: 0.5,
            stream_backoff_max_secs: 30.0,
            shutdown_grace_secs: 30.0,
            context_enabled: false,
            context_ttl_secs: 900,
            context_prefix: None,
            context_redis_url: None,
            context_max_messages: 50,
            metrics_backend: MetricsBackend::Logging,
            metrics_port: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or any
    /// variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let agent_id = require_env("BEAST_AGENT_ID")?;
        let redis_url = require_env("BEAST_REDIS_URL")?;
        let mut builder = Self::new(agent_id, redis_url);

        if let Some(prefix) = get_env_string("BEAST_STREAM_PREFIX") {
            builder.stream_prefix = prefix;
        }
        builder.mailbox_stream = get_env_string("BEAST_MAILBOX_STREAM");
        builder.mailbox_group = get_env_string("BEAST_MAILBOX_GROUP");
        builder.consumer_name = get_env_string("BEAST_CONSUMER_NAME");
        builder.reply_stream = get_env_string("BEAST_REPLY_STREAM");

        // Provider
        if let Some(provider) = get_env_string("BEAST_LLM_PROVIDER") {
            builder.llm_provider = provider.to_ascii_lowercase();
        }
        builder.openai_api_key = get_env_string("BEAST_OPENAI_API_KEY");
        if builder.llm_provider == DEFAULT_PROVIDER && builder.openai_api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("BEAST_OPENAI_API_KEY".to_string()));
        }
        if let Some(base_url) = get_env_string("BEAST_OPENAI_BASE_URL") {
            builder.openai_base_url = base_url;
        }
        if let Some(model) = get_env_string("BEAST_MODEL_NAME") {
            builder.model_name = model;
        }
        if let Some(max_tokens) = get_env_u32("BEAST_MAX_TOKENS")? {
            builder.max_tokens = max_tokens;
        }
        if let Some(temperature) = get_env_f64("BEAST_TEMPERATURE")? {
            builder.temperature = temperature;
        }
        if let Some(timeout) = get_env_f64("BEAST_REQUEST_TIMEOUT")? {
            builder.request_timeout_secs = timeout;
        }

        // Processing
        if let Some(concurrency) = get_env_usize("BEAST_CONCURRENCY")? {
            builder.concurrency = concurrency;
        }
        if let Some(retry_max) = get_env_u32("BEAST_RETRY_MAX")? {
            builder.retry_max = retry_max;
        }
        if let Some(base) = get_env_f64("BEAST_RETRY_BACKOFF_BASE")? {
            builder.retry_backoff_base_secs = base;
        }
        if let Some(max) = get_env_f64("BEAST_RETRY_BACKOFF_MAX")? {
            builder.retry_backoff_max_secs = max;
        }
        if let Some(jitter) = get_env_f64("BEAST_RETRY_JITTER")? {
            builder.retry_jitter = jitter;
        }
        if let Some(interval) = get_env_f64("BEAST_POLL_INTERVAL")? {
            builder.poll_interval_secs = interval;
        }
        if let Some(batch) = get_env_usize("BEAST_READ_BATCH_SIZE")? {
            builder.read_batch_size = batch;
        }
        if let Some(idle) = get_env_f64("BEAST_CLAIM_MIN_IDLE")? {
            builder.claim_min_idle_secs = idle;
        }
        if let Some(maxlen) = get_env_usize("BEAST_STREAM_MAXLEN")? {
            builder.stream_maxlen = maxlen;
        }
        if let Some(base) = get_env_f64("BEAST_STREAM_BACKOFF_BASE")? {
            builder.stream_backoff_base_secs = base;
        }
        if let Some(max) = get_env_f64("BEAST_STREAM_BACKOFF_MAX")? {
            builder.stream_backoff_max_secs = max;
        }
        if let Some(grace) = get_env_f64("BEAST_SHUTDOWN_GRACE")? {
            builder.shutdown_grace_secs = grace;
        }

        // Conversation context
        if let Some(enabled) = get_env_bool("BEAST_CONTEXT_ENABLED")? {
            builder.context_enabled = enabled;
        }
        if let Some(ttl) = get_env_u64("BEAST_CONTEXT_TTL")? {
            builder.context_ttl_secs = ttl;
        }
        builder.context_prefix = get_env_string("BEAST_CONTEXT_PREFIX");
        builder.context_redis_url = get_env_string("BEAST_CONTEXT_REDIS_URL");
        if let Some(max_messages) = get_env_usize("BEAST_CONTEXT_MAX_MESSAGES")? {
            builder.context_max_messages = max_messages;
        }

        // Observability
        if let Some(backend) = get_env_string("BEAST_METRICS_BACKEND") {
            builder.metrics_backend =
                backend
                    .parse()
                    .map_err(|e: beast_observability::ObservabilityError| {
                        ConfigError::InvalidEnvVar {
                            key: "BEAST_METRICS_BACKEND".to_string(),
                            message: e.to_string(),
                        }
                    })?;
        }
        if let Some(port) = get_env_u16("BEAST_METRICS_PORT")? {
            builder.metrics_port = Some(port);
        }
        if let Some(level) = get_env_string("BEAST_LOG_LEVEL") {
            builder.log_level = level;
        }
        if let Some(format) = get_env_string("BEAST_LOG_FORMAT") {
            builder.log_format =
                format
                    .parse()
                    .map_err(|e: beast_observability::ObservabilityError| {
                        ConfigError::InvalidEnvVar {
                            key: "BEAST_LOG_FORMAT".to_string(),
                            message: e.to_string(),
                        }
                    })?;
        }

        Ok(builder)
    }

    #[must_use]
    pub fn stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn mailbox_stream(mut self, stream: impl Into<String>) -> Self {
        self.mailbox_stream = Some(stream.into());
        self
    }

    #[must_use]
    pub fn mailbox_group(mut self, group: impl Into<String>) -> Self {
        self.mailbox_group = Some(group.into());
        self
    }

    #[must_use]
    pub fn consumer_name(mut self, consumer: impl Into<String>) -> Self {
        self.consumer_name = Some(consumer.into());
        self
    }

    #[must_use]
    pub fn reply_stream(mut self, stream: impl Into<String>) -> Self {
        self.reply_stream = Some(stream.into());
        self
    }

    #[must_use]
    pub fn llm_provider(mut self, provider: impl Into<String>) -> Self {
        self.llm_provider = provider.into();
        self
    }

    #[must_use]
    pub fn openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn openai_base_url(mut self, url: impl Into<String>) -> Self {
        self.openai_base_url = url.into();
        self
    }

    #[must_use]
    pub fn model_name(mut self, model: impl Into<String>) -> Self {
        self.model_name = model.into();
        self
    }

    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs_f64();
        self
    }

    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn retry_max(mut self, retry_max: u32) -> Self {
        self.retry_max = retry_max;
        self
    }

    #[must_use]
    pub fn retry_backoff_base(mut self, base: Duration) -> Self {
        self.retry_backoff_base_secs = base.as_secs_f64();
        self
    }

    #[must_use]
    pub fn retry_backoff_max(mut self, max: Duration) -> Self {
        self.retry_backoff_max_secs = max.as_secs_f64();
        self
    }

    #[must_use]
    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs_f64();
        self
    }

    #[must_use]
    pub fn read_batch_size(mut self, batch: usize) -> Self {
        self.read_batch_size = batch;
        self
    }

    #[must_use]
    pub fn claim_min_idle(mut self, idle: Duration) -> Self {
        self.claim_min_idle_secs = idle.as_secs_f64();
        self
    }

    #[must_use]
    pub fn stream_maxlen(mut self, maxlen: usize) -> Self {
        self.stream_maxlen = maxlen;
        self
    }

    #[must_use]
    pub fn stream_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.stream_backoff_base_secs = base.as_secs_f64();
        self.stream_backoff_max_secs = max.as_secs_f64();
        self
    }

    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_secs = grace.as_secs_f64();
        self
    }

    #[must_use]
    pub fn context_enabled(mut self, enabled: bool) -> Self {
        self.context_enabled = enabled;
        self
    }

    #[must_use]
    pub fn context_ttl_secs(mut self, ttl: u64) -> Self {
        self.context_ttl_secs = ttl;
        self
    }

    #[must_use]
    pub fn context_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.context_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn context_redis_url(mut self, url: impl Into<String>) -> Self {
        self.context_redis_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn context_max_messages(mut self, max_messages: usize) -> Self {
        self.context_max_messages = max_messages;
        self
    }

    #[must_use]
    pub fn metrics_backend(mut self, backend: MetricsBackend) -> Self {
        self.metrics_backend = backend;
        self
    }

    #[must_use]
    pub fn metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    #[must_use]
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Validate configuration and build `AgentConfig`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the configuration is invalid.
    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        self.validate()?;

        let agent_id = self.agent_id;
        let mailbox_stream = match self.mailbox_stream {
            Some(stream) => StreamKey::parse(&stream),
            None => StreamKey::inbox(&self.stream_prefix, &agent_id),
        }
        .map_err(|e| ConfigError::ValidationError(format!("mailbox_stream is invalid: {e}")))?;
        let reply_stream = self
            .reply_stream
            .map(StreamKey::parse)
            .transpose()
            .map_err(|e| ConfigError::ValidationError(format!("reply_stream is invalid: {e}")))?;
        let mailbox_group = self
            .mailbox_group
            .unwrap_or_else(|| format!("agent:{agent_id}"));
        let consumer_name = self.consumer_name.unwrap_or_else(|| agent_id.clone());
        // Group and consumer names follow the same rules as stream keys
        Subscription::new(mailbox_stream.clone(), &mailbox_group, &consumer_name)
            .map_err(|e| ConfigError::ValidationError(format!("consumer group is invalid: {e}")))?;

        let context = ContextSettings {
            enabled: self.context_enabled,
            ttl: (self.context_ttl_secs > 0).then(|| Duration::from_secs(self.context_ttl_secs)),
            prefix: self
                .context_prefix
                .unwrap_or_else(|| format!("beast:agent:{agent_id}:context")),
            redis_url: self
                .context_redis_url
                .unwrap_or_else(|| self.redis_url.clone()),
            max_messages: self.context_max_messages,
        };

        Ok(AgentConfig {
            redis_url: self.redis_url,
            stream_prefix: self.stream_prefix,
            mailbox_stream,
            mailbox_group,
            consumer_name,
            reply_stream,
            llm_provider: self.llm_provider,
            openai_api_key: self.openai_api_key.map(ApiKey::new),
            openai_base_url: self.openai_base_url,
            generation: GenerationDefaults {
                model: self.model_name,
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                request_timeout: secs(self.request_timeout_secs),
            },
            concurrency: self.concurrency,
            retry: RetryPolicy::new(
                self.retry_max,
                secs(self.retry_backoff_base_secs),
                secs(self.retry_backoff_max_secs),
                self.retry_jitter,
            ),
            poll_interval: secs(self.poll_interval_secs),
            read_batch_size: self.read_batch_size,
            claim_min_idle: secs(self.claim_min_idle_secs),
            stream_maxlen: self.stream_maxlen,
            stream_backoff: RetryPolicy::unbounded(
                secs(self.stream_backoff_base_secs),
                secs(self.stream_backoff_max_secs),
                self.retry_jitter,
            ),
            shutdown_grace: secs(self.shutdown_grace_secs),
            context,
            metrics_backend: self.metrics_backend,
            metrics_port: self.metrics_port,
            log_level: normalize_log_level(&self.log_level),
            log_format: self.log_format,
            agent_id,
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.agent_id)?;
        validate_redis_url("redis_url", &self.redis_url)?;
        if let Some(url) = &self.context_redis_url {
            validate_redis_url("context_redis_url", url)?;
        }

        if self.stream_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "stream_prefix must not be empty".to_string(),
            ));
        }
        if self.llm_provider.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "llm_provider must not be empty".to_string(),
            ));
        }
        if self
            .openai_api_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "openai_api_key must not be blank".to_string(),
            ));
        }
        match url::Url::parse(&self.openai_base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "openai_base_url must be an http(s) URL, got '{}'",
                    self.openai_base_url
                )));
            }
        }
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "model_name must not be empty".to_string(),
            ));
        }

        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "max_tokens must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        positive("request_timeout", self.request_timeout_secs)?;

        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry_max == 0 {
            return Err(ConfigError::ValidationError(
                "retry_max must be at least 1".to_string(),
            ));
        }
        non_negative("retry_backoff_base", self.retry_backoff_base_secs)?;
        non_negative("retry_backoff_max", self.retry_backoff_max_secs)?;
        if self.retry_backoff_max_secs < self.retry_backoff_base_secs {
            return Err(ConfigError::ValidationError(
                "retry_backoff_max must be >= retry_backoff_base".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::ValidationError(
                "retry_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        positive("poll_interval", self.poll_interval_secs)?;
        if self.read_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "read_batch_size must be at least 1".to_string(),
            ));
        }
        non_negative("claim_min_idle", self.claim_min_idle_secs)?;
        if self.stream_maxlen == 0 {
            return Err(ConfigError::ValidationError(
                "stream_maxlen must be at least 1".to_string(),
            ));
        }
        positive("stream_backoff_base", self.stream_backoff_base_secs)?;
        positive("stream_backoff_max", self.stream_backoff_max_secs)?;
        if self.stream_backoff_max_secs < self.stream_backoff_base_secs {
            return Err(ConfigError::ValidationError(
                "stream_backoff_max must be >= stream_backoff_base".to_string(),
            ));
        }
        non_negative("shutdown_grace", self.shutdown_grace_secs)?;

        if self.context_max_messages < 2 {
            return Err(ConfigError::ValidationError(
                "context_max_messages must be at least 2".to_string(),
            ));
        }
        if self.metrics_port == Some(0) {
            return Err(ConfigError::ValidationError(
                "metrics_port must be between 1 and 65535".to_string(),
            ));
        }
        validate_log_level(&self.log_level)?;

        Ok(())
    }
}

/// Upper bound for any duration setting, in seconds (one week)
const MAX_SECS: f64 = 604_800.0;

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.clamp(0.0, MAX_SECS))
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= MAX_SECS {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{name} must be greater than 0 and at most {MAX_SECS} seconds"
        )))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=MAX_SECS).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{name} must be between 0 and {MAX_SECS} seconds"
        )))
    }
}

fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    if agent_id.is_empty() {
        return Err(ConfigError::ValidationError(
            "agent_id must not be empty".to_string(),
        ));
    }
    if !agent_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ConfigError::ValidationError(format!(
            "agent_id '{agent_id}' may only contain alphanumeric characters, hyphens, underscores, and dots"
        )));
    }
    Ok(())
}

fn validate_redis_url(name: &str, value: &str) -> Result<(), ConfigError> {
    match url::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "redis" | "rediss") => Ok(()),
        Ok(url) => Err(ConfigError::ValidationError(format!(
            "{name} must use redis:// or rediss://, got '{}://'",
            url.scheme()
        ))),
        Err(e) => Err(ConfigError::ValidationError(format!(
            "{name} is not a valid URL: {e}"
        ))),
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

fn normalize_log_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        other => other.to_string(),
    }
}

fn validate_log_level(level: &str) -> Result<(), ConfigError> {
    let normalized = normalize_log_level(level);
    // Filter directives such as `beast_agent=debug,info` pass through as-is
    if normalized.contains('=') || normalized.contains(',') || LOG_LEVELS.contains(&normalized.as_str())
    {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "log_level '{level}' is not one of {}",
            LOG_LEVELS.join(", ")
        )))
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    get_env_string(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Non-blank value of an environment variable
fn get_env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn get_env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match get_env_string(key) {
        Some(val) => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!(
                    "invalid boolean value '{val}', expected true/false/1/0/yes/no/on/off"
                ),
            }),
        },
        None => Ok(None),
    }
}

fn get_env_parsed<T>(key: &str, type_name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match get_env_string(key) {
        Some(val) => val
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid {type_name} value '{val}': {e}"),
            }),
        None => Ok(None),
    }
}

fn get_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    get_env_parsed(key, "u64")
}

fn get_env_u32(key: &str) -> Result<Option<u32>, ConfigError> {
    get_env_parsed(key, "u32")
}

fn get_env_u16(key: &str) -> Result<Option<u16>, ConfigError> {
    get_env_parsed(key, "u16")
}

fn get_env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    get_env_parsed(key, "usize")
}

fn get_env_f64(key: &str) -> Result<Option<f64>, ConfigError> {
    get_env_parsed(key, "f64")
}
