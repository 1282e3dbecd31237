//! Response shaping independent of any web framework.

use std::collections::BTreeMap;

use crate::ratelimit::Quota;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

/// The three things the admission layer needs to do to a response.
///
/// Implement this for the host framework's response type.
pub trait ResponseAdapter {
    fn set_status(&mut self, status: u16);
    fn set_body(&mut self, body: &str);
    fn set_header(&mut self, name: &str, value: &str);
}

/// Write the `X-RateLimit-*` headers for a quota.
///
/// The reset header is in whole seconds since the epoch, rounded up.
pub fn annotate(response: &mut dyn ResponseAdapter, quota: &Quota) {
    response.set_header(HEADER_LIMIT, &quota.limit.to_string());
    response.set_header(HEADER_REMAINING, &quota.remaining.to_string());
    response.set_header(HEADER_RESET, &quota.reset_at.div_ceil(1000).to_string());
}

/// Plain response value, for hosts without a response type of their own
/// and for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SimpleResponse {
    /// Unset until something rejects the request
    pub status: Option<u16>,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl SimpleResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

impl ResponseAdapter for SimpleResponse {
    fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    fn set_body(&mut self, body: &str) {
        self.body = Some(body.to_string());
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }
}
