//! Per-key request and block tallies.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Snapshot of one key's tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub requests: u64,
    pub blocks: u64,
}

#[derive(Debug, Default)]
struct Tally {
    requests: AtomicU64,
    blocks: AtomicU64,
}

/// Process-lifetime tally of admitted and blocked requests per key.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    stats: DashMap<String, Tally>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an admitted request.
    pub fn record_request(&self, key: &str) {
        self.tally(key, |t| &t.requests);
    }

    /// Count a denied or throttled request.
    pub fn record_block(&self, key: &str) {
        self.tally(key, |t| &t.blocks);
    }

    fn tally(&self, key: &str, field: impl Fn(&Tally) -> &AtomicU64) {
        // Fast path under a shared shard lock; only new keys take the write lock.
        if let Some(tally) = self.stats.get(key) {
            field(tally.value()).fetch_add(1, Ordering::Relaxed);
            return;
        }
        let tally = self.stats.entry(key.to_string()).or_default();
        field(tally.value()).fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all tallies, ordered by key.
    pub fn stats(&self) -> BTreeMap<String, KeyStats> {
        self.stats
            .iter()
            .map(|entry| {
                let tally = entry.value();
                (
                    entry.key().clone(),
                    KeyStats {
                        requests: tally.requests.load(Ordering::Relaxed),
                        blocks: tally.blocks.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_creates_entries() {
        let metrics = MetricsRecorder::new();
        metrics.record_request("a");
        metrics.record_request("a");
        metrics.record_block("b");

        let stats = metrics.stats();
        assert_eq!(stats["a"], KeyStats { requests: 2, blocks: 0 });
        assert_eq!(stats["b"], KeyStats { requests: 0, blocks: 1 });
    }

    #[test]
    fn test_stats_is_idempotent() {
        let metrics = MetricsRecorder::new();
        metrics.record_request("a");
        metrics.record_block("a");

        assert_eq!(metrics.stats(), metrics.stats());
    }

    #[test]
    fn test_empty() {
        assert!(MetricsRecorder::new().stats().is_empty());
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(MetricsRecorder::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_request("shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.stats()["shared"].requests, 8000);
    }
}
