//! In-process implementation of [`MailboxStream`]
//!
//! Mirrors the consumer-group semantics of Redis Streams closely enough to
//! drive the agent end to end in tests: a per-group delivery cursor, a
//! pending-entry list with idle times, and claim/ack. Entry ids come from a
//! single counter (`1-0`, `2-0`, ...) shared by every stream in the store.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    error::{StreamError, StreamResult},
    message::{MailboxMessage, StreamEntry},
    stream::MailboxStream,
    types::{EntryId, StreamKey, Subscription},
};

#[derive(Debug)]
struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry
    cursor: usize,
    pending: BTreeMap<EntryId, PendingInfo>,
    acked: Vec<EntryId>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    last_id: u64,
    unavailable: bool,
    reject_publish: bool,
}

impl Inner {
    fn check_available(&self) -> StreamResult<()> {
        if self.unavailable {
            Err(StreamError::ConnectionFailed(
                "in-memory stream marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn append(&mut self, stream: &str, fields: HashMap<String, String>) -> EntryId {
        self.last_id += 1;
        let id = EntryId::from_parts(self.last_id, 0);
        self.streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(StreamEntry::new(id.clone(), fields));
        id
    }

    fn group_mut(&mut self, sub: &Subscription) -> StreamResult<(&mut GroupState, &[StreamEntry])> {
        let missing = || StreamError::GroupMissing {
            stream: sub.stream.to_string(),
            group: sub.group.clone(),
        };
        let state = self.streams.get_mut(sub.stream.as_str()).ok_or_else(missing)?;
        let group = state.groups.get_mut(&sub.group).ok_or_else(missing)?;
        Ok((group, &state.entries))
    }
}

/// Mailbox stream held entirely in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryMailboxStream {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemoryMailboxStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connectivity error until reset
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Make `publish` fail with [`StreamError::PublishFailed`] until reset
    pub async fn set_reject_publish(&self, reject: bool) {
        self.inner.lock().await.reject_publish = reject;
    }

    /// Append raw fields to a stream, bypassing message encoding
    pub async fn append_raw(&self, stream: &StreamKey, fields: &[(&str, &str)]) -> EntryId {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let id = self.inner.lock().await.append(stream.as_str(), fields);
        self.notify.notify_waiters();
        id
    }

    /// All entries currently on a stream, in order
    pub async fn entries(&self, stream: &StreamKey) -> Vec<StreamEntry> {
        self.inner
            .lock()
            .await
            .streams
            .get(stream.as_str())
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Decoded messages on a stream, skipping entries that do not decode
    pub async fn messages(&self, stream: &StreamKey) -> Vec<MailboxMessage> {
        self.entries(stream)
            .await
            .iter()
            .filter_map(|e| e.decode().ok())
            .collect()
    }

    /// Ids pending (delivered, not acknowledged) for a group
    pub async fn pending(&self, stream: &StreamKey, group: &str) -> Vec<EntryId> {
        self.inner
            .lock()
            .await
            .streams
            .get(stream.as_str())
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids acknowledged by a group, in acknowledgement order
    pub async fn acked(&self, stream: &StreamKey, group: &str) -> Vec<EntryId> {
        self.inner
            .lock()
            .await
            .streams
            .get(stream.as_str())
            .and_then(|s| s.groups.get(group))
            .map(|g| g.acked.clone())
            .unwrap_or_default()
    }

    /// How many times an entry has been delivered to the group
    pub async fn delivery_count(&self, stream: &StreamKey, group: &str, id: &EntryId) -> u32 {
        self.inner
            .lock()
            .await
            .streams
            .get(stream.as_str())
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(id))
            .map_or(0, |p| p.deliveries)
    }
}

#[async_trait]
impl MailboxStream for InMemoryMailboxStream {
    async fn ensure_group(&self, sub: &Subscription) -> StreamResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner
            .streams
            .entry(sub.stream.to_string())
            .or_default()
            .groups
            .entry(sub.group.clone())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        sub: &Subscription,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;

        loop {
            // Registered before inspecting state so a concurrent publish is
            // not missed.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                inner.check_available()?;
                let (group, entries) = inner.group_mut(sub)?;

                let end = entries.len().min(group.cursor + count.max(1));
                let delivered: Vec<StreamEntry> = entries[group.cursor..end].to_vec();
                group.cursor = end;

                let now = Instant::now();
                for entry in &delivered {
                    group.pending.insert(
                        entry.id.clone(),
                        PendingInfo {
                            consumer: sub.consumer.clone(),
                            delivered_at: now,
                            deliveries: 1,
                        },
                    );
                }

                if !delivered.is_empty() || block.is_zero() {
                    return Ok(delivered);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_pending(
        &self,
        sub: &Subscription,
        min_idle: Duration,
        _page_size: usize,
    ) -> StreamResult<Vec<StreamEntry>> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let (group, entries) = match inner.group_mut(sub) {
            Ok(found) => found,
            Err(StreamError::GroupMissing { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, info) in group.pending.iter_mut() {
            if now.duration_since(info.delivered_at) < min_idle {
                continue;
            }
            if let Some(entry) = entries.iter().find(|e| &e.id == id) {
                debug!(id = %id, from = %info.consumer, to = %sub.consumer, "Claiming pending entry");
                info.consumer = sub.consumer.clone();
                info.delivered_at = now;
                info.deliveries += 1;
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, sub: &Subscription, id: &EntryId) -> StreamResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let (group, _) = inner.group_mut(sub)?;
        if group.pending.remove(id).is_some() {
            group.acked.push(id.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        target: &StreamKey,
        message: &MailboxMessage,
    ) -> StreamResult<EntryId> {
        let fields = message
            .to_fields()?
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let id = {
            let mut inner = self.inner.lock().await;
            inner.check_available()?;
            if inner.reject_publish {
                return Err(StreamError::PublishFailed(format!(
                    "publish to {target} rejected"
                )));
            }
            inner.append(target.as_str(), fields)
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn ping(&self) -> StreamResult<()> {
        self.inner.lock().await.check_available()
    }
}
