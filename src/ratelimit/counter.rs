//! Counter records for the two counting algorithms.
//!
//! These are plain values; callers are responsible for serializing access
//! per key (the in-process store does so with its shard locks).

use super::clock::Timestamp;

/// Fixed-window counter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRecord {
    /// Requests counted in the current window
    pub count: u64,
    /// When the current window ends
    pub reset_at: Timestamp,
}

impl WindowRecord {
    /// Start a fresh, empty window at `now`.
    pub fn new(now: Timestamp, window_ms: u64) -> Self {
        Self {
            count: 0,
            reset_at: now.saturating_add(window_ms),
        }
    }

    /// Count one request, rolling the window over first if it has ended.
    pub fn increment(&mut self, now: Timestamp, window_ms: u64) -> WindowCount {
        if now >= self.reset_at {
            *self = Self::new(now, window_ms);
        }
        self.count += 1;

        WindowCount {
            count: self.count,
            reset_at: self.reset_at,
        }
    }
}

/// Token-bucket record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRecord {
    /// Tokens left until the next refill
    pub tokens: u64,
    /// When the bucket was last refilled
    pub last_refill: Timestamp,
}

impl BucketRecord {
    /// A full bucket refilled at `now`.
    pub fn new(now: Timestamp, capacity: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Try to take one token, refilling first if the interval has passed.
    pub fn consume(&mut self, now: Timestamp, capacity: u64, interval_ms: u64) -> TokenState {
        if now > self.last_refill.saturating_add(interval_ms) {
            *self = Self::new(now, capacity);
        }

        let consumed = self.tokens >= 1;
        if consumed {
            self.tokens -= 1;
        }

        TokenState {
            tokens: self.tokens,
            consumed,
            reset_at: self.last_refill.saturating_add(interval_ms),
        }
    }
}

/// Result of a windowed increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count after this increment
    pub count: u64,
    /// End of the window the increment landed in
    pub reset_at: Timestamp,
}

/// Result of a token consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenState {
    /// Tokens remaining after the attempt
    pub tokens: u64,
    /// Whether a token was available and taken
    pub consumed: bool,
    /// Next refill time
    pub reset_at: Timestamp,
}
