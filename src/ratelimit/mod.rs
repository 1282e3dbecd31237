//! Rate limiting logic and state management.

mod clock;
mod counter;
mod memory;
mod metrics;
mod policy;
mod remote;
mod store;

#[cfg(feature = "redis")]
mod redis_client;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use counter::{BucketRecord, TokenState, WindowCount, WindowRecord};
pub use memory::MemoryStore;
pub use metrics::{KeyStats, MetricsRecorder};
pub use policy::{CountingMode, Decision, DynamicLimit, Outcome, Policy, PolicyEvaluator, Quota};
pub use remote::{RemoteCounterClient, RemoteStore, RemoteStoreConfig};
pub use store::{CounterStore, StoreKind};

#[cfg(feature = "redis")]
pub use redis_client::RedisCounterClient;
