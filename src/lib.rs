//! Turnstile - Request Admission Control
//!
//! This crate decides, per incoming request, whether to allow, throttle, or
//! reject it based on per-key quotas. Quotas are counted either in fixed
//! windows (with an optional burst overlay) or in token buckets, and the
//! counters live in an in-process store or a shared remote store. When the
//! remote store is unreachable, requests fail open.

pub mod admission;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use admission::{Admission, AdmissionLayer, ResponseAdapter, SimpleResponse};
pub use config::{PolicyConfig, TurnstileConfig};
pub use error::{AdmissionError, Result, StoreError};
