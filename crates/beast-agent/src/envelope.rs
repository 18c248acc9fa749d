//! Response envelopes published back to requesters

use beast_stream::{EntryId, MailboxMessage, StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::message::{InboundMessage, ValidationError, lenient_metadata};
use crate::provider::{Completion, Usage};

/// Message type of every published response
pub const RESPONSE_MESSAGE_TYPE: &str = "agent_response";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Who asked, copied from the request and never invented
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Payload of an `agent_response` message
///
/// Exactly one of `response` and `error` is set, matching `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: EnvelopeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Stream entry id of the request
    pub message_id: String,
    pub correlation: Correlation,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn success(message: &InboundMessage, completion: &Completion) -> Self {
        Self {
            status: EnvelopeStatus::Success,
            response: Some(ResponseBody {
                content: completion.content.clone(),
                model: completion.model.clone(),
                usage: completion.usage,
                provider: completion.provider.clone(),
            }),
            request_id: completion.request_id.clone(),
            error: None,
            message_id: message.id.to_string(),
            correlation: Correlation {
                sender: message.sender.clone(),
                thread_id: message.thread_id.clone(),
            },
            metadata: message.metadata.clone(),
        }
    }

    pub fn failure(message: &InboundMessage, error: &ProviderError) -> Self {
        Self {
            status: EnvelopeStatus::Error,
            response: None,
            request_id: None,
            error: Some(ErrorBody {
                code: error.code.clone(),
                message: error.message.clone(),
                retryable: error.is_retryable(),
                details: error.details.clone(),
            }),
            message_id: message.id.to_string(),
            correlation: Correlation {
                sender: message.sender.clone(),
                thread_id: message.thread_id.clone(),
            },
            metadata: message.metadata.clone(),
        }
    }

    /// Error envelope for a request that never passed validation
    pub fn invalid(id: &EntryId, message: &MailboxMessage, error: &ValidationError) -> Self {
        let thread_id = match message.payload.get("thread_id") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Self::rejected(
            id,
            &message.sender,
            thread_id,
            error,
            lenient_metadata(message),
        )
    }

    /// Error envelope for an entry whose payload could not be decoded at all
    ///
    /// Only the sender survives, so correlation carries no thread and the
    /// metadata is empty.
    pub fn undecodable(id: &EntryId, sender: &str, reason: impl Into<String>) -> Self {
        let error = ValidationError::invalid(reason);
        Self::rejected(id, sender, None, &error, Map::new())
    }

    fn rejected(
        id: &EntryId,
        sender: &str,
        thread_id: Option<String>,
        error: &ValidationError,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            status: EnvelopeStatus::Error,
            response: None,
            request_id: None,
            error: Some(ErrorBody {
                code: error.code.to_string(),
                message: error.message.clone(),
                retryable: false,
                details: Map::new(),
            }),
            message_id: id.to_string(),
            correlation: Correlation {
                sender: sender.to_string(),
                thread_id,
            },
            metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == EnvelopeStatus::Success
    }

    /// Wrap as a mailbox message from `agent_id` to the original sender
    pub fn to_mailbox_message(&self, agent_id: &str) -> StreamResult<MailboxMessage> {
        let payload = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => {
                return Err(StreamError::SerializationFailed(
                    "response envelope did not serialize to an object".to_string(),
                ));
            }
        };
        Ok(MailboxMessage::new(
            agent_id,
            self.correlation.sender.clone(),
            RESPONSE_MESSAGE_TYPE,
            payload,
        ))
    }

    /// Read an envelope back out of a published message
    pub fn from_mailbox_message(message: &MailboxMessage) -> StreamResult<Self> {
        Ok(serde_json::from_value(Value::Object(message.payload.clone()))?)
    }
}
