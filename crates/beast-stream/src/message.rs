//! Mailbox wire format
//!
//! Every stream entry carries a flat map of string fields. A mailbox message
//! occupies six of them: `message_id`, `sender`, `recipient`, `message_type`,
//! `timestamp` and `payload`, the latter holding a JSON object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{StreamError, StreamResult};
use crate::types::EntryId;

/// Message type used when an entry does not declare one
pub const DEFAULT_MESSAGE_TYPE: &str = "direct_message";

const FIELD_MESSAGE_ID: &str = "message_id";
const FIELD_SENDER: &str = "sender";
const FIELD_RECIPIENT: &str = "recipient";
const FIELD_MESSAGE_TYPE: &str = "message_type";
const FIELD_TIMESTAMP: &str = "timestamp";
const FIELD_PAYLOAD: &str = "payload";

/// A message exchanged through mailbox streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxMessage {
    /// Producer-assigned identifier (not the stream entry id)
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl MailboxMessage {
    /// Create a message with a fresh id and the current timestamp
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: message_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Flatten into stream fields
    pub fn to_fields(&self) -> StreamResult<Vec<(&'static str, String)>> {
        Ok(vec![
            (FIELD_MESSAGE_ID, self.message_id.clone()),
            (FIELD_SENDER, self.sender.clone()),
            (FIELD_RECIPIENT, self.recipient.clone()),
            (FIELD_MESSAGE_TYPE, self.message_type.clone()),
            (FIELD_TIMESTAMP, self.timestamp.to_rfc3339()),
            (FIELD_PAYLOAD, serde_json::to_string(&self.payload)?),
        ])
    }
}

/// One raw entry as read from a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn new(id: EntryId, fields: HashMap<String, String>) -> Self {
        Self { id, fields }
    }

    /// The `sender` field, if present and non-blank
    pub fn sender(&self) -> Option<&str> {
        self.fields
            .get(FIELD_SENDER)
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Decode the entry into a mailbox message
    ///
    /// Missing optional fields are filled in: `message_id` falls back to the
    /// entry id, `message_type` to [`DEFAULT_MESSAGE_TYPE`], an unparseable
    /// or absent `timestamp` to now, and an absent `payload` to `{}`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::MalformedEntry`] when the sender is missing or
    /// the payload is not a JSON object.
    pub fn decode(&self) -> StreamResult<MailboxMessage> {
        let malformed = |reason: &str| StreamError::MalformedEntry {
            id: self.id.to_string(),
            reason: reason.to_string(),
        };

        let sender = self.sender().ok_or_else(|| malformed("missing sender"))?;

        let payload = match self.fields.get(FIELD_PAYLOAD) {
            None => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => return Err(malformed("payload is not a JSON object")),
                Err(e) => return Err(malformed(&format!("payload is not valid JSON: {e}"))),
            },
        };

        let timestamp = self
            .fields
            .get(FIELD_TIMESTAMP)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(MailboxMessage {
            message_id: self
                .fields
                .get(FIELD_MESSAGE_ID)
                .cloned()
                .unwrap_or_else(|| self.id.to_string()),
            sender: sender.to_string(),
            recipient: self.fields.get(FIELD_RECIPIENT).cloned().unwrap_or_default(),
            message_type: self
                .fields
                .get(FIELD_MESSAGE_TYPE)
                .cloned()
                .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string()),
            timestamp,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(fields: &[(&str, &str)]) -> StreamEntry {
        StreamEntry::new(
            EntryId::parse("1-0").unwrap(),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn fields_decode_back_to_message() {
        let mut payload = Map::new();
        payload.insert("prompt".into(), json!("2+2?"));
        let msg = MailboxMessage::new("svc-a", "agent-1", DEFAULT_MESSAGE_TYPE, payload);

        let fields = msg
            .to_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = StreamEntry::new(EntryId::parse("1-0").unwrap(), fields)
            .decode()
            .unwrap();

        assert_eq!(decoded.sender, "svc-a");
        assert_eq!(decoded.message_id, msg.message_id);
        assert_eq!(decoded.payload["prompt"], "2+2?");
        assert_eq!(
            decoded.timestamp.timestamp_millis(),
            msg.timestamp.timestamp_millis()
        );
    }

    #[test]
    fn missing_sender_is_malformed() {
        let err = entry(&[("payload", "{}")]).decode().unwrap_err();
        assert!(err.to_string().contains("missing sender"));

        let err = entry(&[("sender", "   ")]).decode().unwrap_err();
        assert!(err.to_string().contains("missing sender"));
    }

    #[test]
    fn payload_must_be_a_json_object() {
        let err = entry(&[("sender", "a"), ("payload", "[1,2]")])
            .decode()
            .unwrap_err();
        assert!(err.to_string().contains("not a JSON object"));

        let err = entry(&[("sender", "a"), ("payload", "{oops")])
            .decode()
            .unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn optional_fields_get_defaults() {
        let msg = entry(&[("sender", "a")]).decode().unwrap();
        assert_eq!(msg.message_id, "1-0");
        assert_eq!(msg.message_type, DEFAULT_MESSAGE_TYPE);
        assert_eq!(msg.recipient, "");
        assert!(msg.payload.is_empty());
    }
}
