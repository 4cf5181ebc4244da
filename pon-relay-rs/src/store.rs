//! Key-value scratchpad backing the bid board and the allow-list probes.
//!
//! Two primitives are assumed of the backend: plain keys with a TTL and hash
//! fields with a TTL on the owning key. The bounty check-and-set leans on the
//! backend's own atomic set-if-absent, never on composed reads and writes.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("store serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;
    /// Atomic set-if-absent with a TTL. Returns whether the write won.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;
    /// Atomic set-if-absent on a hash field. Returns whether the write won.
    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;
    async fn flush_all(&self) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connects, pings, and flushes the scratchpad once; stale bids from a
    /// previous run must not leak into the new process.
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(uri)?;
        let connection = ConnectionManager::new(client).await?;
        let store = Self { connection };
        store.flush_all().await?;
        Ok(store)
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = redis::cmd("GET").arg(key).query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let value = redis::cmd("HGET").arg(key).arg(field).query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        if let Some(ttl) = ttl {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        // SET .. NX EX returns OK when the write won and Nil when it lost
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let won = redis::cmd("HSETNX")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(won)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let pairs = redis::cmd("HGETALL").arg(key).query_async(&mut self.conn()).await?;
        Ok(pairs)
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        redis::cmd("FLUSHALL").query_async::<_, ()>(&mut self.conn()).await?;
        Ok(())
    }
}
