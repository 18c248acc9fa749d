//! Redis Streams implementation of [`MailboxStream`]

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen, StreamReadOptions,
    StreamReadReply,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    error::{StreamError, StreamResult},
    message::{MailboxMessage, StreamEntry},
    stream::MailboxStream,
    types::{EntryId, StreamKey, Subscription},
};

/// Cursor value XAUTOCLAIM starts from and returns once the scan is complete
const AUTOCLAIM_START: &str = "0-0";

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Maximum number of connections in the pool
    pub pool_size: usize,
    /// Approximate `MAXLEN` applied to every published stream
    pub maxlen: usize,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 8,
            maxlen: 1000,
        }
    }
}

impl RedisStreamConfig {
    /// Create a new Redis configuration
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the pool size
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the approximate stream length cap
    pub fn with_maxlen(mut self, maxlen: usize) -> Self {
        self.maxlen = maxlen;
        self
    }
}

/// Mailbox stream backed by Redis Streams consumer groups
pub struct RedisMailboxStream {
    pool: deadpool_redis::Pool,
    config: RedisStreamConfig,
}

impl RedisMailboxStream {
    /// Connect with default configuration and verify the server answers
    pub async fn new(url: impl Into<String>) -> StreamResult<Self> {
        let stream = Self::from_config(RedisStreamConfig::new(url))?;
        stream.ping().await?;
        debug!("Redis mailbox stream connected to {}", stream.config.url);
        Ok(stream)
    }

    /// Build the connection pool without touching the server
    ///
    /// Connections are opened on first use, so an unreachable server shows
    /// up as a connectivity error from the first operation.
    pub fn from_config(config: RedisStreamConfig) -> StreamResult<Self> {
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        redis_config.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size.max(1)));

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool, config })
    }

    pub fn config(&self) -> &RedisStreamConfig {
        &self.config
    }

    /// Get a connection from the pool
    async fn get_connection(&self) -> StreamResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))
    }
}

fn is_missing_group(err: &redis::RedisError) -> bool {
    err.code() == Some("NOGROUP")
}

fn entry_from_stream_id(raw: &StreamId) -> StreamResult<StreamEntry> {
    let id = EntryId::parse(&raw.id).map_err(|e| StreamError::InvalidIdentifier(e.to_string()))?;
    let mut fields = HashMap::with_capacity(raw.map.len());
    for (key, value) in &raw.map {
        let text: String = redis::from_redis_value(value).map_err(|e| {
            StreamError::MalformedEntry {
                id: raw.id.clone(),
                reason: format!("field '{key}' is not a string: {e}"),
            }
        })?;
        fields.insert(key.clone(), text);
    }
    Ok(StreamEntry::new(id, fields))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl MailboxStream for RedisMailboxStream {
    async fn ensure_group(&self, sub: &Subscription) -> StreamResult<()> {
        let mut conn = self.get_connection().await?;

        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(sub.stream.as_str(), &sub.group, "0")
            .await;

        match created {
            Ok(()) => {
                info!(stream = %sub.stream, group = %sub.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %sub.stream, group = %sub.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        sub: &Subscription,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        let entries = {
            let mut conn = self.get_connection().await?;
            let options = StreamReadOptions::default()
                .group(&sub.group, &sub.consumer)
                .count(count);

            // Pooled connections carry a response timeout, so the read never
            // blocks server-side; the wait happens below instead.
            let reply: Option<StreamReadReply> = conn
                .xread_options(&[sub.stream.as_str()], &[">"], &options)
                .await
                .map_err(|e| {
                    if is_missing_group(&e) {
                        StreamError::GroupMissing {
                            stream: sub.stream.to_string(),
                            group: sub.group.clone(),
                        }
                    } else {
                        e.into()
                    }
                })?;

            reply
                .map(|r| r.keys.into_iter().flat_map(|key| key.ids).collect::<Vec<_>>())
                .unwrap_or_default()
                .iter()
                .map(entry_from_stream_id)
                .collect::<StreamResult<Vec<_>>>()?
        };

        if entries.is_empty() && !block.is_zero() {
            tokio::time::sleep(block).await;
        }

        Ok(entries)
    }

    async fn claim_pending(
        &self,
        sub: &Subscription,
        min_idle: Duration,
        page_size: usize,
    ) -> StreamResult<Vec<StreamEntry>> {
        let mut conn = self.get_connection().await?;
        let mut cursor = AUTOCLAIM_START.to_string();
        let mut claimed = Vec::new();

        loop {
            let options = StreamAutoClaimOptions::default().count(page_size.max(1));
            let reply: redis::RedisResult<StreamAutoClaimReply> = conn
                .xautoclaim_options(
                    sub.stream.as_str(),
                    &sub.group,
                    &sub.consumer,
                    millis(min_idle),
                    &cursor,
                    options,
                )
                .await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) if is_missing_group(&e) => {
                    debug!(stream = %sub.stream, group = %sub.group, "No group yet, nothing to claim");
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e.into()),
            };

            if !reply.deleted_ids.is_empty() {
                warn!(
                    stream = %sub.stream,
                    count = reply.deleted_ids.len(),
                    "Pending entries were trimmed before they could be claimed"
                );
            }

            for raw in &reply.claimed {
                claimed.push(entry_from_stream_id(raw)?);
            }

            if reply.next_stream_id == AUTOCLAIM_START {
                break;
            }
            cursor = reply.next_stream_id;
        }

        debug!(stream = %sub.stream, count = claimed.len(), "Claimed pending entries");
        Ok(claimed)
    }

    async fn ack(&self, sub: &Subscription, id: &EntryId) -> StreamResult<()> {
        let mut conn = self.get_connection().await?;

        let _: i64 = conn
            .xack(sub.stream.as_str(), &sub.group, &[id.as_str()])
            .await
            .map_err(|e| StreamError::AckFailed {
                id: id.to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    async fn publish(
        &self,
        target: &StreamKey,
        message: &MailboxMessage,
    ) -> StreamResult<EntryId> {
        let fields = message.to_fields()?;
        let mut conn = self.get_connection().await?;

        let id: String = conn
            .xadd_maxlen(
                target.as_str(),
                StreamMaxlen::Approx(self.config.maxlen),
                "*",
                fields.as_slice(),
            )
            .await
            .map_err(|e| StreamError::PublishFailed(format!("XADD to {target} failed: {e}")))?;

        EntryId::parse(&id).map_err(|e| StreamError::InvalidIdentifier(e.to_string()))
    }

    async fn ping(&self) -> StreamResult<()> {
        let mut conn = self.get_connection().await?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| StreamError::ConnectionFailed(format!("PING failed: {}", e)))?;

        Ok(())
    }
}
