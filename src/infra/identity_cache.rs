//! Usage: Caller cache backends (Redis for production, in-memory with an injectable clock).

use crate::domain::identity::CallerCache;
use crate::shared::error::AppResult;
use crate::shared::mutex_ext::MutexExt;
use crate::shared::time::SharedClock;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone)]
pub struct RedisCallerCache {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisCallerCache {
    /// Connects and pings once; an unreachable cache is a startup failure.
    pub async fn connect(addr: &str) -> AppResult<Self> {
        let url = if addr.starts_with("redis://") || addr.starts_with("rediss://") {
            addr.to_string()
        } else {
            format!("redis://{addr}")
        };
        let client = redis::Client::open(url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!(addr, "redis caller cache connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CallerCache for RedisCallerCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    value: String,
    expires_at: Duration,
}

/// Time-based eviction only; expired entries are dropped on read.
pub struct MemoryCallerCache {
    clock: SharedClock,
    entries: Mutex<HashMap<String, CachedEntry>>,
}

impl MemoryCallerCache {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock_or_recover().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CallerCache for MemoryCallerCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock_or_recover();
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        if now >= entry.expires_at {
            entries.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> AppResult<()> {
        let expires_at = self.clock.now().saturating_add(ttl);
        self.entries
            .lock_or_recover()
            .insert(key.to_string(), CachedEntry { value, expires_at });
        Ok(())
    }
}
