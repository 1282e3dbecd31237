//! Counter store backed by a shared remote counter service.
//!
//! Each logical record is split across two sub-keys that expire with the
//! window (or refill interval), which bounds memory on the remote side:
//!
//! - fixed window: `{prefix}{key}` holds the count, `{prefix}{key}:reset`
//!   the window end;
//! - token bucket: `{prefix}{key}` holds the tokens,
//!   `{prefix}{key}:last_refill` the last refill time.
//!
//! Counting relies on the service's atomic INCR/DECR. The two sub-keys are
//! NOT updated atomically together, so some skew is possible:
//!
//! - requests racing at a rollover may each reinitialise the record, which
//!   drops the counts of the losers;
//! - a counter that expires between the timestamp read and the INCR is
//!   recreated by the INCR; it is re-armed with an expiry right away, and
//!   the re-arm only sets the expiry so concurrent INCRs are kept.
//!
//! Both are accepted in exchange for not taking distributed locks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::clock::Timestamp;
use super::counter::{TokenState, WindowCount};
use super::store::{check_bucket, check_window, CounterStore, StoreKind};
use crate::error::StoreError;

/// Minimal client interface for a remote counter service.
#[async_trait]
pub trait RemoteCounterClient: Send + Sync {
    /// Read an integer value.
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Write an integer value that expires after `ttl`.
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically add one and return the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically subtract one and return the new value.
    async fn decr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set the expiry of an existing key without touching its value.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[async_trait]
impl<C: RemoteCounterClient + ?Sized> RemoteCounterClient for Arc<C> {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        (**self).incr(key).await
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        (**self).decr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        (**self).expire(key, ttl).await
    }
}

/// Configuration for the remote store.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// Prefix for every key written to the service (default: "turnstile:")
    pub key_prefix: String,
    /// Upper bound for a single remote call; exceeding it counts as an outage
    pub timeout: Option<Duration>,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "turnstile:".to_string(),
            timeout: None,
        }
    }
}

/// Counter store that keeps its records in a remote counter service.
pub struct RemoteStore<C> {
    client: C,
    config: RemoteStoreConfig,
}

impl<C> std::fmt::Debug for RemoteStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: RemoteCounterClient> RemoteStore<C> {
    /// Create a remote store with the default configuration.
    pub fn new(client: C) -> Self {
        Self::with_config(client, RemoteStoreConfig::default())
    }

    /// Create a remote store with a custom configuration.
    pub fn with_config(client: C, config: RemoteStoreConfig) -> Self {
        Self { client, config }
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Run a remote call under the configured timeout.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        T: Send,
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                StoreError::Unavailable(format!("{} timed out after {:?}", op, limit))
            })?,
            None => fut.await,
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl<C: RemoteCounterClient> CounterStore for RemoteStore<C> {
    async fn windowed_increment(
        &self,
        key: &str,
        _limit: u64,
        window_ms: u64,
        now: Timestamp,
    ) -> Result<WindowCount, StoreError> {
        check_window(window_ms)?;

        let count_key = self.key(key);
        let reset_key = format!("{}:reset", count_key);
        let ttl = Duration::from_millis(window_ms);

        let reset_at = self.call("get", self.client.get(&reset_key)).await?;

        match reset_at {
            Some(reset_at) if now < reset_at.max(0) as u64 => {
                let count = self.call("incr", self.client.incr(&count_key)).await?;
                let reset_at = reset_at as u64;
                if count == 1 {
                    // The counter expired under us; give the new one a TTL.
                    let remaining = Duration::from_millis(reset_at - now);
                    self.call("expire", self.client.expire(&count_key, remaining))
                        .await?;
                }

                trace!(key = %key, count = count, reset_at = reset_at, "Incremented remote window");

                Ok(WindowCount {
                    count: count.max(0) as u64,
                    reset_at,
                })
            }
            _ => {
                let reset_at = now.saturating_add(window_ms);
                self.call("set", self.client.set(&count_key, 1, ttl)).await?;
                self.call("set", self.client.set(&reset_key, to_i64(reset_at), ttl))
                    .await?;

                debug!(key = %key, reset_at = reset_at, "Started remote window");

                Ok(WindowCount { count: 1, reset_at })
            }
        }
    }

    async fn consume_token(
        &self,
        key: &str,
        capacity: u64,
        interval_ms: u64,
        now: Timestamp,
    ) -> Result<TokenState, StoreError> {
        check_bucket(capacity, interval_ms)?;

        let tokens_key = self.key(key);
        let refill_key = format!("{}:last_refill", tokens_key);
        let ttl = Duration::from_millis(interval_ms);

        let last_refill = self.call("get", self.client.get(&refill_key)).await?;

        match last_refill {
            Some(last) if now <= (last.max(0) as u64).saturating_add(interval_ms) => {
                let reset_at = (last.max(0) as u64).saturating_add(interval_ms);
                let after = self.call("decr", self.client.decr(&tokens_key)).await?;

                if after < 0 {
                    // Overshot an empty bucket; put the token back.
                    self.call("incr", self.client.incr(&tokens_key)).await?;
                    trace!(key = %key, "Remote bucket empty");
                    return Ok(TokenState {
                        tokens: 0,
                        consumed: false,
                        reset_at,
                    });
                }

                Ok(TokenState {
                    tokens: after as u64,
                    consumed: true,
                    reset_at,
                })
            }
            _ => {
                let tokens = capacity - 1;
                self.call("set", self.client.set(&tokens_key, to_i64(tokens), ttl))
                    .await?;
                self.call("set", self.client.set(&refill_key, to_i64(now), ttl))
                    .await?;

                debug!(key = %key, capacity = capacity, "Refilled remote bucket");

                Ok(TokenState {
                    tokens,
                    consumed: true,
                    reset_at: now.saturating_add(interval_ms),
                })
            }
        }
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Remote
    }
}
