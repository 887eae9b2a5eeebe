//! Auto-Execution Circuit Breaker
//!
//! Fixed-window counter per action. At most `max` automatic executions of
//! the same action are admitted per window; the window restarts on the first
//! attempt after it has elapsed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Default admitted executions per window
pub const DEFAULT_AUTO_CIRCUIT_MAX: u32 = 3;

/// Default window length in seconds
pub const DEFAULT_AUTO_CIRCUIT_WINDOW_SECS: u64 = 600;

/// Counter state for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub action: String,
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

/// Outcome of an acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Execution admitted; `remaining` more fit in the current window
    Allowed { count: u32, remaining: u32 },
    /// Budget exhausted until the window rolls over
    Open { retry_after_secs: u64 },
}

impl CircuitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CircuitDecision::Allowed { .. })
    }
}

/// Per-action rate limiter for destructive automatic executions
#[derive(Debug)]
pub struct CircuitBreaker {
    states: Mutex<HashMap<String, CircuitState>>,
    max: u32,
    window: chrono::Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            DEFAULT_AUTO_CIRCUIT_MAX,
            Duration::from_secs(DEFAULT_AUTO_CIRCUIT_WINDOW_SECS),
        )
    }
}

impl CircuitBreaker {
    /// Create a breaker admitting `max` executions per `window`
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            max,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Try to take one execution slot for `action` now
    pub fn try_acquire(&self, action: &str) -> CircuitDecision {
        self.try_acquire_at(action, Utc::now())
    }

    /// Try to take one execution slot for `action` as of `now`
    ///
    /// Window reset, budget check and increment happen under one lock. A
    /// denied attempt does not consume budget.
    pub fn try_acquire_at(&self, action: &str, now: DateTime<Utc>) -> CircuitDecision {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);

        let state = states
            .entry(action.to_string())
            .or_insert_with(|| CircuitState {
                action: action.to_string(),
                window_start: now,
                count: 0,
            });

        if now.signed_duration_since(state.window_start) > self.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count >= self.max {
            let reopens_at = state.window_start + self.window;
            let retry_after_secs = reopens_at
                .signed_duration_since(now)
                .num_seconds()
                .max(0) as u64
                + 1;
            return CircuitDecision::Open { retry_after_secs };
        }

        state.count += 1;
        CircuitDecision::Allowed {
            count: state.count,
            remaining: self.max - state.count,
        }
    }

    /// Current state of every tracked action
    pub fn snapshot(&self) -> Vec<CircuitState> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = states.values().cloned().collect();
        out.sort_by(|a, b| a.action.cmp(&b.action));
        out
    }

    /// State for a single action, if it has been attempted
    pub fn state(&self, action: &str) -> Option<CircuitState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(action)
            .cloned()
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window.to_std().unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_admits_up_to_max_then_opens() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(600));

        for i in 1..=3 {
            assert_eq!(
                breaker.try_acquire_at("restart_service", t0()),
                CircuitDecision::Allowed {
                    count: i,
                    remaining: 3 - i
                }
            );
        }
        assert!(!breaker.try_acquire_at("restart_service", t0()).is_allowed());
    }

    #[test]
    fn test_denied_attempts_do_not_increment() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(600));
        assert!(breaker.try_acquire_at("deploy", t0()).is_allowed());
        for _ in 0..5 {
            assert!(!breaker.try_acquire_at("deploy", t0()).is_allowed());
        }
        assert_eq!(breaker.state("deploy").unwrap().count, 1);
    }

    #[test]
    fn test_window_resets_after_elapsing() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(600));
        assert!(breaker.try_acquire_at("deploy", t0()).is_allowed());
        assert!(breaker.try_acquire_at("deploy", t0() + secs(10)).is_allowed());

        // Exactly at the window edge the old window still applies
        assert!(!breaker.try_acquire_at("deploy", t0() + secs(600)).is_allowed());

        let after = t0() + secs(601);
        assert_eq!(
            breaker.try_acquire_at("deploy", after),
            CircuitDecision::Allowed {
                count: 1,
                remaining: 1
            }
        );
        let state = breaker.state("deploy").unwrap();
        assert_eq!(state.window_start, after);
    }

    #[test]
    fn test_actions_are_independent() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(600));
        assert!(breaker.try_acquire_at("restart_service", t0()).is_allowed());
        assert!(breaker.try_acquire_at("fetch_logs", t0()).is_allowed());
        assert!(!breaker.try_acquire_at("restart_service", t0()).is_allowed());
    }

    #[test]
    fn test_retry_after_points_to_window_end() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(600));
        breaker.try_acquire_at("deploy", t0());
        assert_eq!(
            breaker.try_acquire_at("deploy", t0() + secs(100)),
            CircuitDecision::Open {
                retry_after_secs: 501
            }
        );
    }

    #[test]
    fn test_zero_budget_never_admits() {
        let breaker = CircuitBreaker::new(0, Duration::from_secs(600));
        assert!(!breaker.try_acquire_at("deploy", t0()).is_allowed());
    }

    #[test]
    fn test_snapshot_sorted() {
        let breaker = CircuitBreaker::default();
        breaker.try_acquire_at("restart_service", t0());
        breaker.try_acquire_at("deploy", t0());
        let names: Vec<_> = breaker.snapshot().into_iter().map(|s| s.action).collect();
        assert_eq!(names, vec!["deploy", "restart_service"]);
    }

    #[tokio::test]
    async fn test_concurrent_attempts_never_exceed_max() {
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(600)));

        let attempts = (0..100).map(|_| {
            let breaker = breaker.clone();
            tokio::spawn(async move { breaker.try_acquire("restart_service").is_allowed() })
        });
        let admitted = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 3);
        assert_eq!(breaker.state("restart_service").unwrap().count, 3);
    }
}
