//! Replay Guard
//!
//! Rejects requests whose timestamp is outside the tolerance window and
//! requests reusing a nonce that was accepted within the nonce TTL.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Default lifetime of a remembered nonce
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(5 * 60);

/// Default allowed clock skew between caller and server, in seconds
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: u64 = 300;

/// Reasons a request fails the replay check
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("nonce is missing")]
    MissingNonce,

    #[error("timestamp is missing")]
    MissingTimestamp,

    #[error("timestamp is not an integer: {0}")]
    InvalidTimestamp(String),

    #[error("timestamp {timestamp} is more than {tolerance_secs}s away from {now}")]
    Stale {
        timestamp: i64,
        now: i64,
        tolerance_secs: u64,
    },

    #[error("nonce was already used")]
    Replayed,
}

/// A remembered nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceRecord {
    pub nonce: String,
    pub seen_at: DateTime<Utc>,
}

/// In-memory nonce store with timestamp freshness checks
#[derive(Debug)]
pub struct ReplayGuard {
    /// nonce -> first accepted at
    nonces: Mutex<HashMap<String, DateTime<Utc>>>,

    nonce_ttl: chrono::Duration,

    tolerance_secs: u64,
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_TTL, DEFAULT_TIMESTAMP_TOLERANCE_SECS)
    }
}

impl ReplayGuard {
    /// Create a guard with the given nonce TTL and timestamp tolerance
    pub fn new(nonce_ttl: Duration, tolerance_secs: u64) -> Self {
        Self {
            nonces: Mutex::new(HashMap::new()),
            nonce_ttl: chrono::Duration::from_std(nonce_ttl)
                .unwrap_or(chrono::Duration::MAX),
            tolerance_secs,
        }
    }

    /// Boolean form of [`ReplayGuard::check`]
    pub fn is_replay_valid(&self, nonce: Option<&str>, timestamp: Option<&Value>) -> bool {
        self.check(nonce, timestamp).is_ok()
    }

    /// Validate and consume a `(nonce, timestamp)` pair against the wall clock
    pub fn check(&self, nonce: Option<&str>, timestamp: Option<&Value>) -> Result<(), ReplayError> {
        self.check_at(nonce, timestamp, Utc::now())
    }

    /// Validate and consume a `(nonce, timestamp)` pair as of `now`
    ///
    /// Pruning, freshness, lookup and insertion all happen under one lock.
    pub fn check_at(
        &self,
        nonce: Option<&str>,
        timestamp: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<(), ReplayError> {
        let mut nonces = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune_locked(&mut nonces, self.nonce_ttl, now);

        let nonce = nonce
            .filter(|n| !n.is_empty())
            .ok_or(ReplayError::MissingNonce)?;
        let timestamp = parse_timestamp(timestamp)?;

        let now_secs = now.timestamp();
        if now_secs.abs_diff(timestamp) > self.tolerance_secs {
            return Err(ReplayError::Stale {
                timestamp,
                now: now_secs,
                tolerance_secs: self.tolerance_secs,
            });
        }

        if nonces.contains_key(nonce) {
            return Err(ReplayError::Replayed);
        }

        nonces.insert(nonce.to_string(), now);
        Ok(())
    }

    /// Drop nonces older than the TTL as of `now`
    pub fn prune_at(&self, now: DateTime<Utc>) {
        let mut nonces = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune_locked(&mut nonces, self.nonce_ttl, now);
    }

    fn prune_locked(
        nonces: &mut HashMap<String, DateTime<Utc>>,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) {
        nonces.retain(|_, seen_at| now.signed_duration_since(*seen_at) <= ttl);
    }

    /// Number of remembered nonces
    pub fn len(&self) -> usize {
        self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of remembered nonces
    pub fn records(&self) -> Vec<NonceRecord> {
        self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(nonce, seen_at)| NonceRecord {
                nonce: nonce.clone(),
                seen_at: *seen_at,
            })
            .collect()
    }

    pub fn tolerance_secs(&self) -> u64 {
        self.tolerance_secs
    }
}

/// Interpret a JSON timestamp as whole unix seconds
///
/// Integers, integral floats and numeric strings are accepted; `0`, `""` and
/// `null` count as missing.
pub fn parse_timestamp(value: Option<&Value>) -> Result<i64, ReplayError> {
    let ts = match value {
        None | Some(Value::Null) => return Err(ReplayError::MissingTimestamp),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        f as i64
                    }
                    _ => return Err(ReplayError::InvalidTimestamp(n.to_string())),
                }
            }
        }
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Err(ReplayError::MissingTimestamp);
            }
            trimmed
                .parse::<i64>()
                .map_err(|_| ReplayError::InvalidTimestamp(s.clone()))?
        }
        Some(other) => return Err(ReplayError::InvalidTimestamp(other.to_string())),
    };

    if ts == 0 {
        return Err(ReplayError::MissingTimestamp);
    }
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn ts(secs: i64) -> Value {
        json!(secs)
    }

    #[test]
    fn test_fresh_request_accepted_once() {
        let guard = ReplayGuard::default();
        let t = ts(now().timestamp());

        assert!(guard.check_at(Some("n-1"), Some(&t), now()).is_ok());
        assert_eq!(
            guard.check_at(Some("n-1"), Some(&t), now()),
            Err(ReplayError::Replayed)
        );
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let guard = ReplayGuard::default();
        let t = ts(now().timestamp());

        assert_eq!(
            guard.check_at(None, Some(&t), now()),
            Err(ReplayError::MissingNonce)
        );
        assert_eq!(
            guard.check_at(Some(""), Some(&t), now()),
            Err(ReplayError::MissingNonce)
        );
        assert_eq!(
            guard.check_at(Some("n"), None, now()),
            Err(ReplayError::MissingTimestamp)
        );
        assert_eq!(
            guard.check_at(Some("n"), Some(&json!(0)), now()),
            Err(ReplayError::MissingTimestamp)
        );
        assert!(guard.is_empty());
    }

    #[test]
    fn test_malformed_timestamp_rejected() {
        let guard = ReplayGuard::default();
        for bad in [json!("yesterday"), json!(1.5), json!(true), json!([1]), json!({})] {
            assert!(matches!(
                guard.check_at(Some("n"), Some(&bad), now()),
                Err(ReplayError::InvalidTimestamp(_))
            ));
        }
    }

    #[test]
    fn test_numeric_string_timestamp_accepted() {
        let guard = ReplayGuard::default();
        let t = json!(now().timestamp().to_string());
        assert!(guard.check_at(Some("n"), Some(&t), now()).is_ok());
    }

    #[test]
    fn test_tolerance_boundary() {
        let guard = ReplayGuard::new(DEFAULT_NONCE_TTL, 300);
        let n = now().timestamp();

        assert!(guard.check_at(Some("a"), Some(&ts(n - 300)), now()).is_ok());
        assert!(guard.check_at(Some("b"), Some(&ts(n + 300)), now()).is_ok());
        assert!(matches!(
            guard.check_at(Some("c"), Some(&ts(n - 301)), now()),
            Err(ReplayError::Stale { .. })
        ));
        assert!(matches!(
            guard.check_at(Some("d"), Some(&ts(n + 301)), now()),
            Err(ReplayError::Stale { .. })
        ));
    }

    #[test]
    fn test_stale_request_does_not_consume_nonce() {
        let guard = ReplayGuard::default();
        let n = now().timestamp();

        assert!(guard.check_at(Some("x"), Some(&ts(n - 1000)), now()).is_err());
        assert!(guard.check_at(Some("x"), Some(&ts(n)), now()).is_ok());
    }

    #[test]
    fn test_nonce_pruned_after_ttl() {
        let guard = ReplayGuard::new(Duration::from_secs(300), 300);
        let start = now();
        assert!(guard
            .check_at(Some("n"), Some(&ts(start.timestamp())), start)
            .is_ok());

        // Still remembered at exactly the TTL
        let at_ttl = start + chrono::Duration::seconds(300);
        assert_eq!(
            guard.check_at(Some("n"), Some(&ts(at_ttl.timestamp())), at_ttl),
            Err(ReplayError::Replayed)
        );

        let later = start + chrono::Duration::seconds(301);
        guard.prune_at(later);
        assert!(guard.is_empty());
        assert!(guard
            .check_at(Some("n"), Some(&ts(later.timestamp())), later)
            .is_ok());
    }

    #[test]
    fn test_records_snapshot() {
        let guard = ReplayGuard::default();
        guard
            .check_at(Some("n-7"), Some(&ts(now().timestamp())), now())
            .unwrap();
        let records = guard.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].nonce, "n-7");
        assert_eq!(records[0].seen_at, now());
    }

    #[tokio::test]
    async fn test_concurrent_same_nonce_admits_exactly_one() {
        let guard = Arc::new(ReplayGuard::default());
        let t = ts(Utc::now().timestamp());

        let attempts = (0..64).map(|_| {
            let guard = guard.clone();
            let t = t.clone();
            tokio::spawn(async move { guard.check(Some("shared-nonce"), Some(&t)).is_ok() })
        });

        let results = futures::future::join_all(attempts).await;
        let accepted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(accepted, 1);
    }

    proptest! {
        #[test]
        fn prop_out_of_tolerance_always_rejected(offset in 301i64..100_000, sign in prop::bool::ANY) {
            let guard = ReplayGuard::default();
            let n = now().timestamp();
            let t = if sign { n + offset } else { n - offset };
            let is_stale = matches!(
                guard.check_at(Some("p"), Some(&ts(t)), now()),
                Err(ReplayError::Stale { .. })
            );
            prop_assert!(is_stale);
        }

        #[test]
        fn prop_in_tolerance_accepted_then_replayed(offset in -300i64..=300, nonce in "[a-zA-Z0-9-]{1,32}") {
            let guard = ReplayGuard::default();
            let t = ts(now().timestamp() + offset);
            prop_assert!(guard.check_at(Some(&nonce), Some(&t), now()).is_ok());
            prop_assert_eq!(
                guard.check_at(Some(&nonce), Some(&t), now()),
                Err(ReplayError::Replayed)
            );
        }
    }
}
