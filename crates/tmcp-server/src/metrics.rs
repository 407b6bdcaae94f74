//! Counter registry and Prometheus exposition.
//!
//! An explicit, injected registry: handlers bump named counters, `/metrics`
//! renders the exposition text, `/security/metrics` summarises the
//! security-relevant subset as JSON.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Counter names used across the server. Keeping them in one table makes
/// the exposition output exhaustive and deterministically ordered.
pub const COUNTERS: [(&str, &str); 8] = [
    ("tmcp_requests_total", "Requests accepted for dispatch"),
    ("tmcp_request_errors_total", "Dispatched requests that failed"),
    ("tmcp_requests_blocked_total", "Requests refused before dispatch"),
    ("tmcp_auth_success_total", "Successful authentications"),
    ("tmcp_auth_failures_total", "Failed authentications"),
    ("tmcp_rate_limited_total", "Requests refused by the rate limiter"),
    ("tmcp_streams_opened_total", "Event streams opened"),
    ("tmcp_responses_truncated_total", "Streams ended by the size cap"),
];

/// Thread-safe counter registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<&'static str, u64>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn incr(&self, name: &'static str) {
        let mut counters = self.counters.lock().expect("metrics lock poisoned");
        *counters.entry(name).or_insert(0) += 1;
    }

    /// Current value of a counter.
    pub fn get(&self, name: &str) -> u64 {
        let counters = self.counters.lock().expect("metrics lock poisoned");
        counters.get(name).copied().unwrap_or(0)
    }

    /// Render the Prometheus exposition text.
    pub fn render_prometheus(&self) -> String {
        let counters = self.counters.lock().expect("metrics lock poisoned");
        let mut out = String::new();
        for (name, help) in COUNTERS {
            let value = counters.get(name).copied().unwrap_or(0);
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        }
        out
    }

    /// JSON summary of auth and rate-limit counters for
    /// `/security/metrics`.
    pub fn security_summary(&self) -> Value {
        json!({
            "auth": {
                "success": self.get("tmcp_auth_success_total"),
                "failures": self.get("tmcp_auth_failures_total"),
            },
            "rateLimit": {
                "rejected": self.get("tmcp_rate_limited_total"),
            },
            "requests": {
                "total": self.get("tmcp_requests_total"),
                "errors": self.get("tmcp_request_errors_total"),
                "blocked": self.get("tmcp_requests_blocked_total"),
            },
        })
    }
}
