//! Error types for stream operations

use thiserror::Error;

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while talking to the mailbox stream
#[derive(Error, Debug)]
pub enum StreamError {
    /// Connection to the stream backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The consumer group does not exist on the stream
    #[error("Consumer group '{group}' missing on stream '{stream}'")]
    GroupMissing { stream: String, group: String },

    /// Failed to publish an entry
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Failed to acknowledge an entry
    #[error("Ack failed for entry {id}: {message}")]
    AckFailed { id: String, message: String },

    /// Entry fields could not be turned into a mailbox message
    #[error("Malformed entry {id}: {reason}")]
    MalformedEntry { id: String, reason: String },

    /// Message serialization failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Invalid key, group or entry id
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Backend-specific error (Redis, etc.)
    #[error("Backend error: {0}")]
    BackendError(String),
}

impl StreamError {
    /// Whether the error indicates the backend could not be reached.
    ///
    /// Callers back off and retry on these instead of treating them as
    /// per-entry failures.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            StreamError::ConnectionFailed(_) | StreamError::BackendError(_)
        )
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            StreamError::ConnectionFailed(err.to_string())
        } else {
            StreamError::BackendError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::SerializationFailed(err.to_string())
    }
}
