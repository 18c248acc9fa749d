//! Core mailbox stream trait

use async_trait::async_trait;
use std::time::Duration;

use crate::{
    error::StreamResult,
    message::{MailboxMessage, StreamEntry},
    types::{EntryId, StreamKey, Subscription},
};

/// Consumer-group access to a durable, append-only message stream
///
/// The stream store owns the read cursor and the pending-entry list of each
/// group; implementations keep no read position of their own.
#[async_trait]
pub trait MailboxStream: Send + Sync {
    /// Create the consumer group, creating the stream when absent
    ///
    /// An already existing group is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    async fn ensure_group(&self, sub: &Subscription) -> StreamResult<()>;

    /// Read up to `count` entries never delivered to this group
    ///
    /// Waits up to `block` when nothing is available and returns an empty
    /// vector on timeout. Returned entries become pending for `sub.consumer`
    /// until acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::GroupMissing`](crate::StreamError::GroupMissing)
    /// if the group was deleted, or a connectivity error.
    async fn read_group(
        &self,
        sub: &Subscription,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>>;

    /// Transfer every pending entry idle for at least `min_idle` to
    /// `sub.consumer` and return them in stream order
    ///
    /// `page_size` bounds each round trip, not the total.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error. A missing group yields an empty result.
    async fn claim_pending(
        &self,
        sub: &Subscription,
        min_idle: Duration,
        page_size: usize,
    ) -> StreamResult<Vec<StreamEntry>>;

    /// Acknowledge an entry, removing it from the pending list
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AckFailed`](crate::StreamError::AckFailed) or a
    /// connectivity error.
    async fn ack(&self, sub: &Subscription, id: &EntryId) -> StreamResult<()>;

    /// Append a message to `target` and return its entry id
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::PublishFailed`](crate::StreamError::PublishFailed)
    /// or a connectivity error.
    async fn publish(&self, target: &StreamKey, message: &MailboxMessage)
    -> StreamResult<EntryId>;

    /// Check reachability without consuming anything
    ///
    /// # Errors
    ///
    /// Returns a connectivity error when the backend is unreachable.
    async fn ping(&self) -> StreamResult<()>;
}
