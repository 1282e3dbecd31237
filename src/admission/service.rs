//! Per-request admission flow.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::events::EventLog;
use super::response::{annotate, ResponseAdapter};
use crate::config::PolicyConfig;
use crate::error::{AdmissionError, Result, StoreError};
use crate::ratelimit::{
    Clock, CounterStore, Decision, DynamicLimit, KeyStats, MemoryStore, MetricsRecorder, Outcome,
    Policy, PolicyEvaluator, Quota, StoreKind, SystemClock, Timestamp,
};

/// Maps a request to its quota key.
pub type KeyFn<Req> = Arc<dyn Fn(&Req) -> String + Send + Sync>;

/// Replaces the default rejection for denied or throttled requests.
pub type RejectFn<Req> = Arc<dyn Fn(&Req, &mut dyn ResponseAdapter) + Send + Sync>;

const DENY_STATUS: u16 = 403;
const DENY_BODY: &str = "Forbidden";
const THROTTLE_STATUS: u16 = 429;
const THROTTLE_BODY: &str = "Too Many Requests";

/// Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Allowed,
    Denied,
    Throttled,
    /// The remote store was unreachable and the request was let through.
    FallbackAllowed,
}

impl Admission {
    /// Whether the host should pass the request on to the next handler.
    pub fn forwards(&self) -> bool {
        matches!(self, Admission::Allowed | Admission::FallbackAllowed)
    }
}

/// Admission middleware: one instance per protected route or service,
/// shared by all concurrent requests.
pub struct AdmissionLayer<Req> {
    evaluator: PolicyEvaluator,
    key_fn: KeyFn<Req>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<MetricsRecorder>>,
    events: EventLog,
    on_deny: Option<RejectFn<Req>>,
    on_limit: Option<RejectFn<Req>>,
    emit_headers: bool,
}

impl<Req> AdmissionLayer<Req> {
    /// Start building a layer for `config`, keyed by `key_fn`.
    pub fn builder<F>(config: PolicyConfig, key_fn: F) -> AdmissionBuilder<Req>
    where
        F: Fn(&Req) -> String + Send + Sync + 'static,
    {
        AdmissionBuilder {
            config,
            key_fn: Arc::new(key_fn),
            store: None,
            clock: None,
            dynamic_limit: None,
            on_deny: None,
            on_limit: None,
        }
    }

    /// Decide on one request, writing any rejection or headers to `response`.
    ///
    /// Returns the terminal state; the caller forwards the request when
    /// [`Admission::forwards`] is true. Errors are only returned for
    /// configuration mistakes and for failures of a local store.
    #[instrument(skip_all, fields(key = tracing::field::Empty))]
    pub async fn handle<R>(&self, request: &Req, response: &mut R) -> Result<Admission>
    where
        R: ResponseAdapter,
    {
        let key = (self.key_fn)(request);
        tracing::Span::current().record("key", key.as_str());
        let now = self.clock.now_ms();

        let decision = match self.evaluator.evaluate(&key, now).await {
            Ok(decision) => decision,
            Err(err) => return self.recover(&key, now, err).await,
        };

        match decision.outcome {
            Outcome::Deny => {
                self.events
                    .record(&format!("Blocked deny-listed key: {}", key))
                    .await;
                match &self.on_deny {
                    Some(callback) => callback(request, response),
                    None => reject(response, DENY_STATUS, DENY_BODY),
                }
                self.record_block(&key);
                Ok(Admission::Denied)
            }
            Outcome::Throttled => {
                if let Some(quota) = &decision.quota {
                    let message = match decision.count {
                        Some(count) => {
                            format!("Key {} hit limit: {}/{}", key, count, quota.limit)
                        }
                        None => format!("Key {} out of tokens", key),
                    };
                    self.events.record(&message).await;
                    self.annotate(response, quota);
                }
                match &self.on_limit {
                    Some(callback) => callback(request, response),
                    None => reject(response, THROTTLE_STATUS, THROTTLE_BODY),
                }
                self.record_block(&key);
                Ok(Admission::Throttled)
            }
            Outcome::Allow => {
                if let Some(quota) = &decision.quota {
                    self.annotate(response, quota);
                }
                self.record_request(&key);
                Ok(Admission::Allowed)
            }
        }
    }

    /// Evaluate without touching a response. Used by hosts that shape
    /// responses themselves.
    pub async fn decide(&self, key: &str) -> Result<Decision> {
        self.evaluator.evaluate(key, self.clock.now_ms()).await
    }

    /// Snapshot of per-key tallies, or `None` when metrics are disabled.
    pub fn metrics(&self) -> Option<BTreeMap<String, KeyStats>> {
        self.metrics.as_ref().map(|m| m.stats())
    }

    pub fn policy(&self) -> &Policy {
        self.evaluator.policy()
    }

    /// Turn an evaluation failure into a terminal state.
    ///
    /// A remote outage fails open: the request is counted once against a
    /// throwaway in-process store and forwarded. Anything else from the
    /// store fails closed.
    async fn recover(&self, key: &str, now: Timestamp, err: AdmissionError) -> Result<Admission> {
        let remote = self.evaluator.store().kind() == StoreKind::Remote;

        match err {
            AdmissionError::Store(StoreError::Unavailable(reason)) if remote => {
                warn!(key = %key, error = %reason, "Counter store unavailable, failing open");
                self.events.record(&format!("Error: {}", reason)).await;
                self.events
                    .record("Falling back to in-memory store")
                    .await;

                let policy = self.evaluator.policy();
                let limit = policy.effective_limit(key)?;
                let fallback = MemoryStore::new();
                if let Err(e) = fallback
                    .windowed_increment(key, limit, policy.fallback_window_ms(), now)
                    .await
                {
                    debug!(key = %key, error = %e, "Fallback count failed");
                }

                self.record_request(key);
                Ok(Admission::FallbackAllowed)
            }
            AdmissionError::Configuration(_) => Err(err),
            other => {
                error!(key = %key, error = %other, "Admission failed");
                self.events.record(&format!("Error: {}", other)).await;
                Err(AdmissionError::Internal(other.to_string()))
            }
        }
    }

    fn annotate(&self, response: &mut dyn ResponseAdapter, quota: &Quota) {
        if self.emit_headers {
            annotate(response, quota);
        }
    }

    fn record_request(&self, key: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_request(key);
        }
    }

    fn record_block(&self, key: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_block(key);
        }
    }
}

fn reject(response: &mut dyn ResponseAdapter, status: u16, body: &str) {
    response.set_status(status);
    response.set_body(body);
}

/// Assembles an [`AdmissionLayer`].
pub struct AdmissionBuilder<Req> {
    config: PolicyConfig,
    key_fn: KeyFn<Req>,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    dynamic_limit: Option<DynamicLimit>,
    on_deny: Option<RejectFn<Req>>,
    on_limit: Option<RejectFn<Req>>,
}

impl<Req> AdmissionBuilder<Req> {
    /// Counter store to use (default: a fresh [`MemoryStore`]).
    pub fn store<S: CounterStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Counter store as a trait object, e.g. when picked at runtime.
    pub fn shared_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Time source (default: [`SystemClock`]).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Per-request limit, re-evaluated for every request.
    pub fn dynamic_limit<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> i64 + Send + Sync + 'static,
    {
        self.dynamic_limit = Some(Arc::new(f));
        self
    }

    /// Replace the default 403 for deny-listed keys.
    pub fn on_deny<F>(mut self, f: F) -> Self
    where
        F: Fn(&Req, &mut dyn ResponseAdapter) + Send + Sync + 'static,
    {
        self.on_deny = Some(Arc::new(f));
        self
    }

    /// Replace the default 429 for throttled requests.
    pub fn on_limit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Req, &mut dyn ResponseAdapter) + Send + Sync + 'static,
    {
        self.on_limit = Some(Arc::new(f));
        self
    }

    /// Validate the configuration and build the layer.
    pub fn build(self) -> Result<AdmissionLayer<Req>> {
        let mut policy = Policy::from_config(&self.config)?;
        if let Some(dynamic_limit) = self.dynamic_limit {
            policy = policy.with_dynamic_limit(dynamic_limit);
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let metrics = self
            .config
            .metrics
            .then(|| Arc::new(MetricsRecorder::new()));

        info!(
            mode = ?policy.mode(),
            store = ?store.kind(),
            metrics = metrics.is_some(),
            "Admission layer initialized"
        );

        Ok(AdmissionLayer {
            evaluator: PolicyEvaluator::new(policy, store),
            key_fn: self.key_fn,
            clock,
            metrics,
            events: EventLog::new(self.config.log_events, self.config.log_file.clone()),
            on_deny: self.on_deny,
            on_limit: self.on_limit,
            emit_headers: self.config.emit_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::response::{SimpleResponse, HEADER_LIMIT, HEADER_REMAINING};
    use crate::ratelimit::ManualClock;

    struct Request {
        ip: String,
    }

    fn request(ip: &str) -> Request {
        Request { ip: ip.to_string() }
    }

    fn layer(config: PolicyConfig) -> AdmissionLayer<Request> {
        AdmissionLayer::builder(config, |req: &Request| req.ip.clone())
            .clock(ManualClock::new(0))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed_request_is_annotated() {
        let layer = layer(PolicyConfig::fixed_window(2, 1000));
        let mut response = SimpleResponse::new();

        let admission = layer.handle(&request("1.1.1.1"), &mut response).await.unwrap();

        assert_eq!(admission, Admission::Allowed);
        assert!(admission.forwards());
        assert_eq!(response.status, None);
        assert_eq!(response.header(HEADER_LIMIT), Some("2"));
        assert_eq!(response.header(HEADER_REMAINING), Some("1"));
    }

    #[tokio::test]
    async fn test_throttled_request_gets_429() {
        let layer = layer(PolicyConfig::fixed_window(1, 1000));
        layer
            .handle(&request("1.1.1.1"), &mut SimpleResponse::new())
            .await
            .unwrap();

        let mut response = SimpleResponse::new();
        let admission = layer.handle(&request("1.1.1.1"), &mut response).await.unwrap();

        assert_eq!(admission, Admission::Throttled);
        assert!(!admission.forwards());
        assert_eq!(response.status, Some(429));
        assert_eq!(response.body.as_deref(), Some("Too Many Requests"));
        assert_eq!(response.header(HEADER_REMAINING), Some("0"));
    }

    #[tokio::test]
    async fn test_headers_can_be_disabled() {
        let mut config = PolicyConfig::fixed_window(1, 1000);
        config.emit_headers = false;
        let layer = layer(config);

        let mut response = SimpleResponse::new();
        layer.handle(&request("1.1.1.1"), &mut response).await.unwrap();
        assert!(response.headers.is_empty());
    }

    #[tokio::test]
    async fn test_deny_list_gets_403_without_headers() {
        let mut config = PolicyConfig::fixed_window(10, 1000);
        config.deny_list = vec!["6.6.6.6".to_string()];
        let layer = layer(config);

        let mut response = SimpleResponse::new();
        let admission = layer.handle(&request("6.6.6.6"), &mut response).await.unwrap();

        assert_eq!(admission, Admission::Denied);
        assert_eq!(response.status, Some(403));
        assert_eq!(response.body.as_deref(), Some("Forbidden"));
        assert!(response.headers.is_empty());
    }

    #[tokio::test]
    async fn test_callbacks_replace_default_rejections() {
        let mut config = PolicyConfig::fixed_window(0, 1000);
        config.deny_list = vec!["6.6.6.6".to_string()];
        let layer = AdmissionLayer::builder(config, |req: &Request| req.ip.clone())
            .clock(ManualClock::new(0))
            .on_deny(|req: &Request, res: &mut dyn ResponseAdapter| {
                res.set_status(451);
                res.set_body(&format!("go away {}", req.ip));
            })
            .on_limit(|_: &Request, res: &mut dyn ResponseAdapter| {
                res.set_status(503);
                res.set_body("slow down");
            })
            .build()
            .unwrap();

        let mut response = SimpleResponse::new();
        layer.handle(&request("6.6.6.6"), &mut response).await.unwrap();
        assert_eq!(response.status, Some(451));
        assert_eq!(response.body.as_deref(), Some("go away 6.6.6.6"));

        let mut response = SimpleResponse::new();
        let admission = layer.handle(&request("1.1.1.1"), &mut response).await.unwrap();
        assert_eq!(admission, Admission::Throttled);
        assert_eq!(response.status, Some(503));
        assert_eq!(response.header(HEADER_LIMIT), Some("0"));
    }

    #[tokio::test]
    async fn test_metrics_record_requests_and_blocks() {
        let mut config = PolicyConfig::fixed_window(1, 1000);
        config.metrics = true;
        let layer = layer(config);

        for _ in 0..3 {
            layer
                .handle(&request("1.1.1.1"), &mut SimpleResponse::new())
                .await
                .unwrap();
        }

        let stats = layer.metrics().unwrap();
        assert_eq!(stats["1.1.1.1"], KeyStats { requests: 1, blocks: 2 });
    }

    #[tokio::test]
    async fn test_metrics_disabled_by_default() {
        let layer = layer(PolicyConfig::default());
        layer
            .handle(&request("1.1.1.1"), &mut SimpleResponse::new())
            .await
            .unwrap();
        assert!(layer.metrics().is_none());
    }

    #[tokio::test]
    async fn test_negative_dynamic_limit_propagates() {
        let layer = AdmissionLayer::builder(PolicyConfig::default(), |req: &Request| req.ip.clone())
            .dynamic_limit(|_| -5)
            .build()
            .unwrap();

        let err = layer
            .handle(&request("1.1.1.1"), &mut SimpleResponse::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Configuration(_)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = AdmissionLayer::builder(PolicyConfig::token_bucket(0, 1000), |req: &Request| {
            req.ip.clone()
        })
        .build();
        assert!(matches!(result, Err(AdmissionError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_decide_without_response() {
        let layer = layer(PolicyConfig::fixed_window(1, 1000));
        assert_eq!(layer.decide("k").await.unwrap().outcome, Outcome::Allow);
        assert_eq!(layer.decide("k").await.unwrap().outcome, Outcome::Throttled);
    }
}
