//! Conversation history stores
//!
//! History is keyed by `"{agent_id}:{thread_id}"`. A miss is `None`; a store
//! that cannot be reached reports [`ContextError`], which the handler logs
//! and ignores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::ContextError;
use crate::message::ConversationHistory;

/// Key-value store of prior conversation turns
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Stored history, or `None` when nothing is stored under `key`
    async fn load(&self, key: &str) -> Result<Option<ConversationHistory>, ContextError>;

    /// Replace the history under `key`, expiring after `ttl` when given
    async fn save(
        &self,
        key: &str,
        history: &ConversationHistory,
        ttl: Option<Duration>,
    ) -> Result<(), ContextError>;

    async fn clear(&self, key: &str) -> Result<(), ContextError>;
}

/// Stores nothing; every prompt stands alone
#[derive(Debug, Default, Clone, Copy)]
pub struct NullContextStore;

#[async_trait]
impl ContextStore for NullContextStore {
    async fn load(&self, _key: &str) -> Result<Option<ConversationHistory>, ContextError> {
        Ok(None)
    }

    async fn save(
        &self,
        _key: &str,
        _history: &ConversationHistory,
        _ttl: Option<Duration>,
    ) -> Result<(), ContextError> {
        Ok(())
    }

    async fn clear(&self, _key: &str) -> Result<(), ContextError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredHistory {
    history: ConversationHistory,
    expires_at: Option<Instant>,
}

/// Process-local store; expired entries read as misses
#[derive(Debug, Default, Clone)]
pub struct InMemoryContextStore {
    entries: Arc<RwLock<HashMap<String, StoredHistory>>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn load(&self, key: &str) -> Result<Option<ConversationHistory>, ContextError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(stored) if stored.expires_at.is_none_or(|at| at > now) => {
                    return Ok(Some(stored.history.clone()));
                }
                Some(_) => {}
            }
        }
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn save(
        &self,
        key: &str,
        history: &ConversationHistory,
        ttl: Option<Duration>,
    ) -> Result<(), ContextError> {
        let stored = StoredHistory {
            history: history.clone(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().await.insert(key.to_string(), stored);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), ContextError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// History serialized as JSON under `"{prefix}:{key}"`
pub struct RedisContextStore {
    pool: deadpool_redis::Pool,
    prefix: String,
}

impl RedisContextStore {
    /// Build the pool; no connection is made until first use
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, ContextError> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| ContextError::Backend(e.to_string()))?;
        Ok(Self {
            pool,
            prefix: prefix.into(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection, ContextError> {
        self.pool
            .get()
            .await
            .map_err(|e| ContextError::Backend(e.to_string()))
    }
}

#[async_trait]
impl ContextStore for RedisContextStore {
    async fn load(&self, key: &str) -> Result<Option<ConversationHistory>, ContextError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(&redis_key).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(history) => Ok(Some(history)),
            Err(e) => {
                warn!(key = %redis_key, error = %e, "Stored context is not valid JSON, ignoring");
                Ok(None)
            }
        }
    }

    async fn save(
        &self,
        key: &str,
        history: &ConversationHistory,
        ttl: Option<Duration>,
    ) -> Result<(), ContextError> {
        let redis_key = self.redis_key(key);
        let json = serde_json::to_string(history)?;
        let mut conn = self.get_connection().await?;

        match ttl.map(|ttl| ttl.as_secs().max(1)) {
            Some(secs) => conn.set_ex::<_, _, ()>(&redis_key, json, secs).await?,
            None => conn.set::<_, _, ()>(&redis_key, json).await?,
        }
        debug!(key = %redis_key, turns = history.len(), "Saved context");
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), ContextError> {
        let mut conn = self.get_connection().await?;
        conn.del::<_, ()>(self.redis_key(key)).await?;
        Ok(())
    }
}

/// Store selected by `context.enabled`
pub fn create_context_store(config: &AgentConfig) -> Result<Arc<dyn ContextStore>, ContextError> {
    if config.context.enabled {
        Ok(Arc::new(RedisContextStore::new(
            &config.context.redis_url,
            config.context.prefix.clone(),
        )?))
    } else {
        Ok(Arc::new(NullContextStore))
    }
}
