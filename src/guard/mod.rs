//! Request Admission Guards
//!
//! Process-local shared state consulted by every command request:
//!
//! - [`ReplayGuard`]: timestamp freshness + single-use nonces
//! - [`CircuitBreaker`]: per-action cap on automatic executions
//!
//! Both are constructed once at startup and handed to the command handler.
//! Each performs its check-then-update sequence inside one critical section,
//! so two concurrent requests can never both pass a check meant to admit one.
//! Neither survives a restart nor is shared between instances.

pub mod circuit;
pub mod replay;

pub use circuit::{CircuitBreaker, CircuitDecision, CircuitState};
pub use replay::{NonceRecord, ReplayError, ReplayGuard};
