//! Token authentication and failed-attempt tracking.
//!
//! Credentials arrive as `Authorization: Bearer <t>` or as an `auth_token`
//! cookie. An empty configured token set disables authentication entirely
//! (development mode). Failed attempts are counted deterministically per
//! client address: ten failures within fifteen minutes block the address
//! until the window drains.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Failures tolerated per client address within [`FAILED_WINDOW`].
pub const FAILED_MAX: usize = 10;
/// Rolling window for failed-attempt tracking.
pub const FAILED_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Result of an authentication check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authenticated (or auth disabled); carries the rate-limit identity.
    Allowed {
        /// Token-hash identity, or the client address when auth is off.
        identity: String,
    },
    /// No credentials were presented.
    Missing,
    /// Credentials were presented but match no configured token.
    Invalid,
    /// The client address has exceeded the failed-attempt budget.
    Blocked {
        /// Seconds until the oldest failure leaves the window.
        retry_after: u64,
    },
}

/// Injected authentication state, owned by the server.
#[derive(Debug)]
pub struct Auth {
    tokens: HashSet<String>,
    failed: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Auth {
    /// Build from the configured token set.
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
            failed: Mutex::new(HashMap::new()),
        }
    }

    /// Whether authentication is enforced.
    pub fn enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Check a request's credentials.
    ///
    /// `bearer` is the token from the `Authorization` header (already
    /// stripped of the `Bearer ` prefix), `cookie` the `auth_token` cookie
    /// value, `client` the peer address used for failure tracking.
    pub fn check(&self, bearer: Option<&str>, cookie: Option<&str>, client: &str) -> AuthOutcome {
        if let Some(retry_after) = self.blocked_for(client) {
            return AuthOutcome::Blocked { retry_after };
        }
        if !self.enabled() {
            return AuthOutcome::Allowed {
                identity: format!("addr:{client}"),
            };
        }

        let presented = bearer.or(cookie);
        match presented {
            None => {
                self.record_failure(client);
                AuthOutcome::Missing
            }
            Some(token) if self.tokens.contains(token) => AuthOutcome::Allowed {
                identity: format!("token:{}", token_fingerprint(token)),
            },
            Some(_) => {
                self.record_failure(client);
                AuthOutcome::Invalid
            }
        }
    }

    /// Seconds until `client` is unblocked, if it currently is blocked.
    fn blocked_for(&self, client: &str) -> Option<u64> {
        let mut failed = self.failed.lock().expect("auth lock poisoned");
        let attempts = failed.get_mut(client)?;
        prune(attempts);
        if attempts.len() < FAILED_MAX {
            return None;
        }
        let oldest = *attempts.front()?;
        let elapsed = oldest.elapsed();
        Some(FAILED_WINDOW.saturating_sub(elapsed).as_secs().max(1))
    }

    fn record_failure(&self, client: &str) {
        let mut failed = self.failed.lock().expect("auth lock poisoned");
        let attempts = failed.entry(client.to_string()).or_default();
        prune(attempts);
        attempts.push_back(Instant::now());
    }

    /// Current failure count for a client (for the security summary).
    pub fn failure_count(&self, client: &str) -> usize {
        let mut failed = self.failed.lock().expect("auth lock poisoned");
        failed.get_mut(client).map_or(0, |attempts| {
            prune(attempts);
            attempts.len()
        })
    }

    /// Number of client addresses currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.failed.lock().expect("auth lock poisoned").len()
    }
}

fn prune(attempts: &mut VecDeque<Instant>) {
    while let Some(&front) = attempts.front() {
        if front.elapsed() > FAILED_WINDOW {
            attempts.pop_front();
        } else {
            break;
        }
    }
}

/// Short, stable fingerprint of a token for identity keys and logs. The
/// token itself never appears in logs or metrics.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}
