//! Core type definitions for stream addressing

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Error type for identifier validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    /// The identifier is empty
    Empty,
    /// The identifier contains whitespace
    ContainsWhitespace,
    /// Entry ids must look like `<ms>-<seq>`
    MalformedEntryId(String),
}

impl fmt::Display for IdValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "identifier cannot be empty"),
            Self::ContainsWhitespace => write!(f, "identifier cannot contain whitespace"),
            Self::MalformedEntryId(id) => {
                write!(f, "entry id '{id}' is not of the form <ms>-<seq>")
            }
        }
    }
}

impl std::error::Error for IdValidationError {}

fn validate_name(s: &str) -> Result<(), IdValidationError> {
    if s.is_empty() {
        return Err(IdValidationError::Empty);
    }
    if s.chars().any(char::is_whitespace) {
        return Err(IdValidationError::ContainsWhitespace);
    }
    Ok(())
}

/// Name of a stream, e.g. `beast:mailbox:agent-1:in`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey(String);

impl StreamKey {
    /// Parse and validate a stream key
    ///
    /// # Examples
    ///
    /// ```
    /// use beast_stream::StreamKey;
    ///
    /// assert!(StreamKey::parse("beast:mailbox:agent-1:in").is_ok());
    /// assert!(StreamKey::parse("").is_err());
    /// assert!(StreamKey::parse("has space").is_err());
    /// ```
    pub fn parse(key: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = key.as_ref();
        validate_name(s)?;
        Ok(Self(s.to_string()))
    }

    /// Inbox stream for a party: `{prefix}:{party}:in`
    pub fn inbox(prefix: &str, party: &str) -> Result<Self, IdValidationError> {
        Self::parse(format!("{prefix}:{party}:in"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for StreamKey {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stream-assigned entry id (`<ms>-<seq>`), ordered within a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId {
    raw: String,
    ms: u64,
    seq: u64,
}

impl EntryId {
    /// Parse and validate an entry id
    ///
    /// # Examples
    ///
    /// ```
    /// use beast_stream::EntryId;
    ///
    /// let id = EntryId::parse("1700000000000-3").unwrap();
    /// assert_eq!(id.as_str(), "1700000000000-3");
    /// assert!(EntryId::parse("abc").is_err());
    /// ```
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();
        if s.is_empty() {
            return Err(IdValidationError::Empty);
        }
        let malformed = || IdValidationError::MalformedEntryId(s.to_string());
        let (ms, seq) = s.split_once('-').ok_or_else(malformed)?;
        let ms = ms.parse::<u64>().map_err(|_| malformed())?;
        let seq = seq.parse::<u64>().map_err(|_| malformed())?;
        Ok(Self {
            raw: s.to_string(),
            ms,
            seq,
        })
    }

    pub(crate) fn from_parts(ms: u64, seq: u64) -> Self {
        Self {
            raw: format!("{ms}-{seq}"),
            ms,
            seq,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for EntryId {
    fn eq(&self, other: &Self) -> bool {
        (self.ms, self.seq) == (other.ms, other.seq)
    }
}

impl Eq for EntryId {}

impl Hash for EntryId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.ms, self.seq).hash(state);
    }
}

impl TryFrom<String> for EntryId {
    type Error = IdValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.raw
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ms, self.seq).cmp(&(other.ms, other.seq))
    }
}

impl FromStr for EntryId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Where a consumer reads from: stream, consumer group and consumer name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub stream: StreamKey,
    pub group: String,
    pub consumer: String,
}

impl Subscription {
    /// Build a subscription, validating group and consumer names
    pub fn new(
        stream: StreamKey,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, IdValidationError> {
        let group = group.into();
        let consumer = consumer.into();
        validate_name(&group)?;
        validate_name(&consumer)?;
        Ok(Self {
            stream,
            group,
            consumer,
        })
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}/{}]", self.stream, self.group, self.consumer)
    }
}
