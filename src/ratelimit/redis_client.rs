//! Redis implementation of [`RemoteCounterClient`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};

use super::remote::RemoteCounterClient;
use crate::error::StoreError;

/// Remote counter client talking to Redis.
///
/// `ConnectionManager` reconnects on its own and is cheap to clone, so each
/// call works on a clone instead of serializing callers behind a lock.
#[derive(Clone)]
pub struct RedisCounterClient {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisCounterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterClient").finish_non_exhaustive()
    }
}

impl RedisCounterClient {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns `StoreError::Unavailable` if the connection cannot be made.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        let connection = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self { connection })
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(format!("redis: {}", e))
}

#[async_trait]
impl RemoteCounterClient for RedisCounterClient {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        // PSETEX rejects a zero expiry.
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        conn.pset_ex::<_, _, ()>(key, value, ttl_ms)
            .await
            .map_err(unavailable)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        conn.incr(key, 1).await.map_err(unavailable)
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        conn.decr(key, 1).await.map_err(unavailable)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        conn.pexpire::<_, ()>(key, ttl_ms)
            .await
            .map_err(unavailable)
    }
}
