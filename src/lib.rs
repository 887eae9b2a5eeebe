//! agentgate
//!
//! Authenticated remote-command and secret-rotation control plane. Callers
//! request one of a closed set of actions over HTTP(S); each request is
//! authenticated (mTLS client certificate or HMAC-signed body), checked for
//! freshness and replay, audited, and then either answered with a suggestion
//! or executed through a whitelisted platform script. A separate action pulls
//! a fresh TLS bundle from Vault, installs it atomically and hot-reloads it.

pub mod actions;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod exec;
pub mod guard;
pub mod handler;
pub mod metrics;
pub mod metrics_server;
pub mod rotation;
pub mod server;
pub mod tls;

pub use config::Config;
pub use error::ControlError;
pub use handler::{CommandHandler, CommandResponse, ConnectionInfo};
