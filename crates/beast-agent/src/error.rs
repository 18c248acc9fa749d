//! Error types for the agent

use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Whether a failed provider call is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Transient: rate limits, timeouts, server errors, dropped connections
    Retryable,
    /// Permanent: bad credentials, invalid requests, unusable responses
    Fatal,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::Retryable => f.write_str("retryable"),
            ProviderErrorKind::Fatal => f.write_str("fatal"),
        }
    }
}

/// Classified failure of a provider call
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} provider error {code}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// Machine-readable code echoed to the requester, e.g. `rate_limited`
    pub code: String,
    pub message: String,
    /// Server-provided hint for when to try again
    pub retry_after: Option<Duration>,
    pub details: Map<String, Value>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retry_after: None,
            details: Map::new(),
        }
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Retryable, code, message)
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, code, message)
    }

    /// Fatal error standing in for a panic or other unexpected failure
    pub fn unhandled(message: impl Into<String>) -> Self {
        Self::fatal("unhandled_error", message)
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }
}

/// Context store failures; never fatal to message processing
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Context backend error: {0}")]
    Backend(String),

    #[error("Context serialization failed: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for ContextError {
    fn from(err: redis::RedisError) -> Self {
        ContextError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for ContextError {
    fn from(err: serde_json::Error) -> Self {
        ContextError::Serialization(err.to_string())
    }
}

/// Top-level agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Stream error: {0}")]
    Stream(#[from] beast_stream::StreamError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("Observability error: {0}")]
    Observability(#[from] beast_observability::ObservabilityError),

    #[error("Agent is already running")]
    AlreadyRunning,

    #[error("Agent is not running")]
    NotRunning,

    #[error("Concurrency gate closed")]
    GateClosed,

    #[error("Background task failed: {0}")]
    Task(String),
}
