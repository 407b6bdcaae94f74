//! Per-request correlation IDs.
//!
//! A correlation ID is assigned at the ingress of every request and is
//! immutable for the request's lifetime: it appears on every log line,
//! every terminal event, and in the environment of every subprocess
//! spawned on the request's behalf.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wire prefix shared by all correlation IDs.
const PREFIX: &str = "openspec";

/// Length of the random suffix, in characters.
const RANDOM_LEN: usize = 16;

/// Opaque per-request identifier: `openspec_<base36-millis>_<16-char-random>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation ID for the current instant.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u128;
        let random = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{PREFIX}_{}_{}",
            base36(millis),
            &random[..RANDOM_LEN]
        ))
    }

    /// View the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Structural check used by frame validation and tests.
    ///
    /// Accepts `openspec_<base36>_<16 alphanumerics>`; anything else is an
    /// ID minted outside this process.
    pub fn is_well_formed(s: &str) -> bool {
        let mut parts = s.splitn(3, '_');
        let (Some(prefix), Some(ts), Some(random)) = (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        prefix == PREFIX
            && !ts.is_empty()
            && ts.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            && random.len() == RANDOM_LEN
            && random
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

/// Render a number in lowercase base36.
fn base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_known_values() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn generated_ids_are_well_formed() {
        for _ in 0..32 {
            let id = CorrelationId::generate();
            assert!(
                CorrelationId::is_well_formed(id.as_str()),
                "malformed: {id}"
            );
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_foreign_shapes() {
        assert!(!CorrelationId::is_well_formed(""));
        assert!(!CorrelationId::is_well_formed("openspec"));
        assert!(!CorrelationId::is_well_formed("openspec_abc"));
        assert!(!CorrelationId::is_well_formed("other_abc_0123456789abcdef"));
        assert!(!CorrelationId::is_well_formed("openspec_abc_tooshort"));
        assert!(!CorrelationId::is_well_formed(
            "openspec_ABC_0123456789abcdef"
        ));
    }

    #[test]
    fn serde_is_transparent() {
        let id = CorrelationId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
