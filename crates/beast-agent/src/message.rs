//! Inbound request model and conversation history

use std::fmt;
use std::time::Duration;

use beast_stream::{EntryId, MailboxMessage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error code for requests that fail validation
pub const INVALID_PAYLOAD: &str = "invalid_payload";

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => f.write_str("system"),
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Ordered conversation turns, as stored per thread
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHistory {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Stored turns followed by caller-supplied turns
    ///
    /// A stored turn identical to one the caller supplied is dropped, so
    /// replaying history in a request does not duplicate it.
    pub fn merge(stored: ConversationHistory, explicit: ConversationHistory) -> Self {
        let mut messages: Vec<ChatMessage> = stored
            .messages
            .into_iter()
            .filter(|turn| !explicit.messages.contains(turn))
            .collect();
        messages.extend(explicit.messages);
        Self { messages }
    }

    /// Keep only the most recent `max` turns
    pub fn truncate_to_last(&mut self, max: usize) {
        if self.messages.len() > max {
            let excess = self.messages.len() - max;
            self.messages.drain(..excess);
        }
    }
}

/// Per-message generation overrides; `None` keeps the process default
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Fully resolved generation parameters for one request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Why a request was rejected before reaching the provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl ValidationError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PAYLOAD,
            message: message.into(),
        }
    }
}

/// A validated request read from the mailbox
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Stream entry id; also the correlation id of the response
    pub id: EntryId,
    pub sender: String,
    pub prompt: String,
    pub thread_id: Option<String>,
    pub options: RequestOptions,
    /// Caller-supplied history
    pub context: ConversationHistory,
    pub metadata: Map<String, Value>,
}

impl InboundMessage {
    /// Validate a decoded mailbox message
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] with code `invalid_payload` when the
    /// prompt is missing or blank, or when `thread_id`, `options`, `context`
    /// or `metadata` have the wrong shape.
    pub fn parse(id: EntryId, message: &MailboxMessage) -> Result<Self, ValidationError> {
        let payload = &message.payload;

        let prompt = match payload.get("prompt") {
            Some(Value::String(prompt)) if !prompt.trim().is_empty() => prompt.clone(),
            _ => {
                return Err(ValidationError::invalid(
                    "Payload must include non-empty 'prompt' field",
                ));
            }
        };

        let thread_id = match payload.get("thread_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(_) => {
                return Err(ValidationError::invalid(
                    "Field 'thread_id' must be a string",
                ));
            }
        };

        let options = match payload.get("options") {
            None | Some(Value::Null) => RequestOptions::default(),
            Some(value @ Value::Object(_)) => RequestOptions::deserialize(value).map_err(|e| {
                ValidationError::invalid(format!("Field 'options' is invalid: {e}"))
            })?,
            Some(_) => {
                return Err(ValidationError::invalid(
                    "Field 'options' must be an object",
                ));
            }
        };

        let context = match payload.get("context") {
            None | Some(Value::Null) => ConversationHistory::default(),
            Some(value @ Value::Object(_)) => {
                ConversationHistory::deserialize(value).map_err(|e| {
                    ValidationError::invalid(format!("Field 'context' is invalid: {e}"))
                })?
            }
            Some(_) => {
                return Err(ValidationError::invalid(
                    "Field 'context' must be an object with a 'messages' list",
                ));
            }
        };

        let metadata = match payload.get("metadata") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(ValidationError::invalid(
                    "Field 'metadata' must be an object",
                ));
            }
        };

        Ok(Self {
            id,
            sender: message.sender.clone(),
            prompt,
            thread_id,
            options,
            context,
            metadata,
        })
    }
}

/// Metadata to echo on a rejected message, when it has a usable shape
pub fn lenient_metadata(message: &MailboxMessage) -> Map<String, Value> {
    match message.payload.get("metadata") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}
