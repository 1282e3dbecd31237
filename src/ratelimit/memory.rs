//! In-process counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::clock::Timestamp;
use super::counter::{BucketRecord, TokenState, WindowCount, WindowRecord};
use super::store::{check_bucket, check_window, CounterStore, StoreKind};
use crate::error::StoreError;

/// Counter store held in process memory.
///
/// Records live in sharded maps; each read-modify-write runs under the
/// owning shard's entry lock, so updates to one key are serialized while
/// unrelated keys proceed in parallel. Records are never evicted, they roll
/// over in place.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, WindowRecord>,
    buckets: DashMap<String, BucketRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current window record for a key, if one exists.
    pub fn window(&self, key: &str) -> Option<WindowRecord> {
        self.windows.get(key).map(|r| *r)
    }

    /// Current bucket record for a key, if one exists.
    pub fn bucket(&self, key: &str) -> Option<BucketRecord> {
        self.buckets.get(key).map(|r| *r)
    }

    /// Number of tracked records of either kind.
    pub fn len(&self) -> usize {
        self.windows.len() + self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.windows.clear();
        self.buckets.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn windowed_increment(
        &self,
        key: &str,
        _limit: u64,
        window_ms: u64,
        now: Timestamp,
    ) -> Result<WindowCount, StoreError> {
        check_window(window_ms)?;

        let result = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowRecord::new(now, window_ms))
            .increment(now, window_ms);

        trace!(
            key = %key,
            count = result.count,
            reset_at = result.reset_at,
            "Incremented window counter"
        );

        Ok(result)
    }

    async fn consume_token(
        &self,
        key: &str,
        capacity: u64,
        interval_ms: u64,
        now: Timestamp,
    ) -> Result<TokenState, StoreError> {
        check_bucket(capacity, interval_ms)?;

        let state = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketRecord::new(now, capacity))
            .consume(now, capacity, interval_ms);

        trace!(
            key = %key,
            tokens = state.tokens,
            consumed = state.consumed,
            "Consumed bucket token"
        );

        Ok(state)
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }
}
