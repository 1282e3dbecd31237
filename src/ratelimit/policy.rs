//! Layered admission policy.
//!
//! Evaluation order, short-circuiting at the first step that decides:
//!
//! 1. allow-list: admitted without touching the store;
//! 2. deny-list: rejected without touching the store;
//! 3. effective limit: dynamic limit function or the base limit;
//! 4. token bucket, when configured, replaces fixed-window counting;
//! 5. fixed window, optionally with a burst overlay counted under a derived
//!    key in its own window. The overlay is only drawn on once the base
//!    count is over the limit, so base + burst requests fit in a window.
//!
//! A count that reaches the limit exactly is still admitted; only a count
//! strictly above it is throttled.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use super::clock::Timestamp;
use super::store::CounterStore;
use crate::config::PolicyConfig;
use crate::error::{AdmissionError, Result};

/// Per-request limit override, keyed by the request key.
pub type DynamicLimit = Arc<dyn Fn(&str) -> i64 + Send + Sync>;

/// Suffix for the counter that tracks the burst overlay.
const BURST_SUFFIX: &str = ":burst";

/// What to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Allow,
    Deny,
    Throttled,
}

/// The quota a counted decision was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    /// Applicable limit
    pub limit: u64,
    /// Allowance left after this request
    pub remaining: u64,
    /// When the allowance resets
    pub reset_at: Timestamp,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub outcome: Outcome,
    /// Present when counters were consulted; absent for list decisions.
    pub quota: Option<Quota>,
    /// Requests counted in the base window; fixed-window decisions only.
    pub count: Option<u64>,
}

impl Decision {
    fn listed(outcome: Outcome) -> Self {
        Self {
            outcome,
            quota: None,
            count: None,
        }
    }

    fn counted(outcome: Outcome, limit: u64, remaining: u64, reset_at: Timestamp) -> Self {
        Self {
            outcome,
            quota: Some(Quota {
                limit,
                remaining,
                reset_at,
            }),
            count: None,
        }
    }

    fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allow
    }
}

/// How requests are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountingMode {
    FixedWindow {
        window_ms: u64,
        burst_limit: u64,
        burst_window_ms: u64,
    },
    TokenBucket {
        tokens_per_interval: u64,
        interval_ms: u64,
    },
}

/// Validated, immutable policy.
#[derive(Clone)]
pub struct Policy {
    limit: u64,
    mode: CountingMode,
    allow_list: HashSet<String>,
    deny_list: HashSet<String>,
    dynamic_limit: Option<DynamicLimit>,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("limit", &self.limit)
            .field("mode", &self.mode)
            .field("allow_list", &self.allow_list)
            .field("deny_list", &self.deny_list)
            .field("dynamic_limit", &self.dynamic_limit.is_some())
            .finish()
    }
}

impl Policy {
    /// Validate a configuration and build a policy from it.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        config.validate()?;

        let mode = match config.bucket_params() {
            Some((tokens_per_interval, interval_ms)) => CountingMode::TokenBucket {
                tokens_per_interval,
                interval_ms,
            },
            None => CountingMode::FixedWindow {
                window_ms: config.window_ms,
                burst_limit: config.burst_limit,
                burst_window_ms: config.burst_window_ms(),
            },
        };

        Ok(Self {
            limit: config.limit,
            mode,
            allow_list: config.allow_list.iter().cloned().collect(),
            deny_list: config.deny_list.iter().cloned().collect(),
            dynamic_limit: None,
        })
    }

    /// Override the base limit per request.
    pub fn with_dynamic_limit(mut self, dynamic_limit: DynamicLimit) -> Self {
        self.dynamic_limit = Some(dynamic_limit);
        self
    }

    pub fn mode(&self) -> CountingMode {
        self.mode
    }

    pub fn is_allowed_key(&self, key: &str) -> bool {
        self.allow_list.contains(key)
    }

    pub fn is_denied_key(&self, key: &str) -> bool {
        self.deny_list.contains(key)
    }

    /// The limit that applies to `key` for this request.
    pub fn effective_limit(&self, key: &str) -> Result<u64> {
        match &self.dynamic_limit {
            Some(f) => {
                let limit = f(key);
                u64::try_from(limit).map_err(|_| {
                    AdmissionError::Configuration(format!(
                        "Dynamic limit must be non-negative, got {}",
                        limit
                    ))
                })
            }
            None => Ok(self.limit),
        }
    }

    /// Window used by the degraded local counter when the store is down.
    pub fn fallback_window_ms(&self) -> u64 {
        match self.mode {
            CountingMode::FixedWindow { window_ms, .. } => window_ms,
            CountingMode::TokenBucket { interval_ms, .. } => interval_ms,
        }
    }
}

/// Decides ALLOW / DENY / THROTTLED for request keys.
pub struct PolicyEvaluator {
    policy: Policy,
    store: Arc<dyn CounterStore>,
}

impl PolicyEvaluator {
    pub fn new(policy: Policy, store: Arc<dyn CounterStore>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Evaluate one request for `key` at time `now`.
    pub async fn evaluate(&self, key: &str, now: Timestamp) -> Result<Decision> {
        if self.policy.is_allowed_key(key) {
            trace!(key = %key, "Key is allow-listed");
            return Ok(Decision::listed(Outcome::Allow));
        }

        if self.policy.is_denied_key(key) {
            trace!(key = %key, "Key is deny-listed");
            return Ok(Decision::listed(Outcome::Deny));
        }

        let limit = self.policy.effective_limit(key)?;

        match self.policy.mode {
            CountingMode::TokenBucket {
                tokens_per_interval,
                interval_ms,
            } => {
                let state = self
                    .store
                    .consume_token(key, tokens_per_interval, interval_ms, now)
                    .await?;

                if !state.consumed {
                    debug!(key = %key, "Token bucket empty");
                    return Ok(Decision::counted(
                        Outcome::Throttled,
                        tokens_per_interval,
                        0,
                        state.reset_at,
                    ));
                }

                Ok(Decision::counted(
                    Outcome::Allow,
                    tokens_per_interval,
                    state.tokens,
                    state.reset_at,
                ))
            }
            CountingMode::FixedWindow {
                window_ms,
                burst_limit,
                burst_window_ms,
            } => {
                let base = self
                    .store
                    .windowed_increment(key, limit, window_ms, now)
                    .await?;
                let total_limit = limit.saturating_add(burst_limit);

                trace!(
                    key = %key,
                    count = base.count,
                    limit = limit,
                    "Counted request"
                );

                if base.count <= limit {
                    return Ok(Decision::counted(
                        Outcome::Allow,
                        total_limit,
                        (limit - base.count).saturating_add(burst_limit),
                        base.reset_at,
                    )
                    .with_count(base.count));
                }

                // Over the base limit: draw on the burst allowance.
                if burst_limit > 0 {
                    let burst_key = format!("{}{}", key, BURST_SUFFIX);
                    let burst = self
                        .store
                        .windowed_increment(&burst_key, burst_limit, burst_window_ms, now)
                        .await?;

                    if burst.count <= burst_limit {
                        trace!(key = %key, burst = burst.count, "Admitted on burst allowance");
                        return Ok(Decision::counted(
                            Outcome::Allow,
                            total_limit,
                            burst_limit - burst.count,
                            base.reset_at,
                        )
                        .with_count(base.count));
                    }
                }

                debug!(
                    key = %key,
                    count = base.count,
                    limit = total_limit,
                    "Rate limit exceeded"
                );
                Ok(Decision::counted(
                    Outcome::Throttled,
                    total_limit,
                    0,
                    base.reset_at,
                )
                .with_count(base.count))
            }
        }
    }
}
