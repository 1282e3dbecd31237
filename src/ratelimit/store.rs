//! Counter store trait for abstracting local and remote implementations.

use async_trait::async_trait;

use super::clock::Timestamp;
use super::counter::{TokenState, WindowCount};
use crate::error::StoreError;

/// Where a store keeps its counters.
///
/// The admission layer fails open on remote outages and fails closed on
/// local errors, so it needs to know which one it is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Local,
    Remote,
}

/// Keyed counter storage shared by all concurrent requests.
///
/// Both operations must behave as if serialized per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one request against `key`'s fixed window.
    ///
    /// A missing or expired record (`now >= reset_at`) is replaced by a fresh
    /// window ending at `now + window_ms` before counting. `limit` is only a
    /// hint; the caller compares the returned count against it.
    async fn windowed_increment(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now: Timestamp,
    ) -> Result<WindowCount, StoreError>;

    /// Take one token from `key`'s bucket.
    ///
    /// A missing bucket, or one whose interval has passed
    /// (`now > last_refill + interval_ms`), is refilled to `capacity` first.
    /// An empty bucket stays at zero and reports `consumed == false`.
    async fn consume_token(
        &self,
        key: &str,
        capacity: u64,
        interval_ms: u64,
        now: Timestamp,
    ) -> Result<TokenState, StoreError>;

    /// Whether this store is in-process or remote.
    fn kind(&self) -> StoreKind;
}

/// Shared argument checks for store implementations.
pub(crate) fn check_window(window_ms: u64) -> Result<(), StoreError> {
    if window_ms == 0 {
        return Err(StoreError::InvalidArgument(
            "window_ms must be positive".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn check_bucket(capacity: u64, interval_ms: u64) -> Result<(), StoreError> {
    if capacity == 0 {
        return Err(StoreError::InvalidArgument(
            "capacity must be positive".to_string(),
        ));
    }
    if interval_ms == 0 {
        return Err(StoreError::InvalidArgument(
            "interval_ms must be positive".to_string(),
        ));
    }
    Ok(())
}
