//! Remote store behaviour through the admission layer, including outages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use turnstile::admission::{Admission, AdmissionLayer, SimpleResponse, HEADER_LIMIT};
use turnstile::config::PolicyConfig;
use turnstile::error::{AdmissionError, StoreError};
use turnstile::ratelimit::{
    CounterStore, ManualClock, RemoteCounterClient, RemoteStore, StoreKind, Timestamp, TokenState,
    WindowCount,
};

/// Remote counter service double with an outage switch.
#[derive(Default)]
struct SharedCounters {
    values: Mutex<HashMap<String, i64>>,
    down: AtomicBool,
}

impl SharedCounters {
    fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    fn come_back(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset by peer".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteCounterClient for SharedCounters {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check()?;
        Ok(self.values.lock().get(key).copied())
    }

    async fn set(&self, key: &str, value: i64, _ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.check()?;
        let mut values = self.values.lock();
        let value = values.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.check()?;
        let mut values = self.values.lock();
        let value = values.entry(key.to_string()).or_insert(0);
        *value -= 1;
        Ok(*value)
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
        self.check()
    }
}

/// A local store that is broken.
struct BrokenLocalStore;

#[async_trait]
impl CounterStore for BrokenLocalStore {
    async fn windowed_increment(
        &self,
        _key: &str,
        _limit: u64,
        _window_ms: u64,
        _now: Timestamp,
    ) -> Result<WindowCount, StoreError> {
        Err(StoreError::Unavailable("out of memory".into()))
    }

    async fn consume_token(
        &self,
        _key: &str,
        _capacity: u64,
        _interval_ms: u64,
        _now: Timestamp,
    ) -> Result<TokenState, StoreError> {
        Err(StoreError::Unavailable("out of memory".into()))
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }
}

struct Request {
    ip: String,
}

fn request(ip: &str) -> Request {
    Request { ip: ip.to_string() }
}

fn remote_layer(
    config: PolicyConfig,
    counters: Arc<SharedCounters>,
    clock: &ManualClock,
) -> AdmissionLayer<Request> {
    AdmissionLayer::builder(config, |req: &Request| req.ip.clone())
        .store(Arc::new(RemoteStore::new(counters)))
        .clock(clock.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_remote_store_enforces_limit() {
    let counters = Arc::new(SharedCounters::default());
    let clock = ManualClock::new(0);
    let layer = remote_layer(PolicyConfig::fixed_window(2, 1000), counters.clone(), &clock);

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let mut response = SimpleResponse::new();
        outcomes.push(layer.handle(&request("1.2.3.4"), &mut response).await.unwrap());
    }
    assert_eq!(
        outcomes,
        vec![Admission::Allowed, Admission::Allowed, Admission::Throttled]
    );

    clock.set(1001);
    let mut response = SimpleResponse::new();
    let admission = layer.handle(&request("1.2.3.4"), &mut response).await.unwrap();
    assert_eq!(admission, Admission::Allowed);
    assert_eq!(counters.values.lock().get("turnstile:1.2.3.4"), Some(&1));
}

#[tokio::test]
async fn test_two_layers_share_remote_counts() {
    let counters = Arc::new(SharedCounters::default());
    let clock = ManualClock::new(0);
    let first = remote_layer(PolicyConfig::fixed_window(1, 1000), counters.clone(), &clock);
    let second = remote_layer(PolicyConfig::fixed_window(1, 1000), counters, &clock);

    let mut response = SimpleResponse::new();
    assert_eq!(
        first.handle(&request("1.2.3.4"), &mut response).await.unwrap(),
        Admission::Allowed
    );

    let mut response = SimpleResponse::new();
    assert_eq!(
        second.handle(&request("1.2.3.4"), &mut response).await.unwrap(),
        Admission::Throttled
    );
}

#[tokio::test]
async fn test_remote_outage_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("events.log");

    let counters = Arc::new(SharedCounters::default());
    let clock = ManualClock::new(0);
    let mut config = PolicyConfig::fixed_window(1, 1000);
    config.log_file = Some(log_path.clone());
    let layer = remote_layer(config, counters.clone(), &clock);

    counters.go_down();

    // Far beyond the limit, yet every request is forwarded.
    for _ in 0..5 {
        let mut response = SimpleResponse::new();
        let admission = layer.handle(&request("1.2.3.4"), &mut response).await.unwrap();
        assert_eq!(admission, Admission::FallbackAllowed);
        assert!(admission.forwards());
        assert_eq!(response.status, None);
        assert!(response.header(HEADER_LIMIT).is_none());
    }

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log.contains("Error: connection reset by peer"));
    assert!(log.contains("Falling back to in-memory store"));

    // Nothing was written remotely during the outage.
    counters.come_back();
    assert!(counters.values.lock().is_empty());
    let mut response = SimpleResponse::new();
    let admission = layer.handle(&request("1.2.3.4"), &mut response).await.unwrap();
    assert_eq!(admission, Admission::Allowed);
}

#[tokio::test]
async fn test_remote_outage_in_token_bucket_mode_fails_open() {
    let counters = Arc::new(SharedCounters::default());
    let clock = ManualClock::new(0);
    let layer = remote_layer(PolicyConfig::token_bucket(1, 1000), counters.clone(), &clock);

    counters.go_down();
    let mut response = SimpleResponse::new();
    let admission = layer.handle(&request("1.2.3.4"), &mut response).await.unwrap();
    assert_eq!(admission, Admission::FallbackAllowed);
}

#[tokio::test]
async fn test_local_store_failure_escalates() {
    let clock = ManualClock::new(0);
    let layer = AdmissionLayer::builder(PolicyConfig::fixed_window(5, 1000), |req: &Request| {
        req.ip.clone()
    })
    .store(Arc::new(BrokenLocalStore))
    .clock(clock)
    .build()
    .unwrap();

    let mut response = SimpleResponse::new();
    let err = layer
        .handle(&request("1.2.3.4"), &mut response)
        .await
        .unwrap_err();

    assert!(matches!(err, AdmissionError::Internal(msg) if msg.contains("out of memory")));
    assert_eq!(response.status, None);
}

#[tokio::test]
async fn test_lists_never_reach_a_failing_store() {
    let clock = ManualClock::new(0);
    let mut config = PolicyConfig::fixed_window(5, 1000);
    config.allow_list = vec!["good".to_string()];
    config.deny_list = vec!["bad".to_string()];
    let layer = AdmissionLayer::builder(config, |req: &Request| req.ip.clone())
        .store(Arc::new(BrokenLocalStore))
        .clock(clock)
        .build()
        .unwrap();

    let mut response = SimpleResponse::new();
    assert_eq!(
        layer.handle(&request("good"), &mut response).await.unwrap(),
        Admission::Allowed
    );

    let mut response = SimpleResponse::new();
    assert_eq!(
        layer.handle(&request("bad"), &mut response).await.unwrap(),
        Admission::Denied
    );
}
