//! Admission middleware: the per-request orchestration around the policy
//! evaluator, independent of any web framework.

mod events;
mod response;
mod service;

pub use events::EventLog;
pub use response::{
    annotate, ResponseAdapter, SimpleResponse, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
};
pub use service::{Admission, AdmissionBuilder, AdmissionLayer, KeyFn, RejectFn};
