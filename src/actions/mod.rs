//! Action Whitelist
//!
//! The closed set of operations a remote caller may request. Script-backed
//! actions are variants of [`Action`]; the only other accepted name is the
//! `rotate_certs` pseudo-action, which is served by the certificate rotator
//! instead of a script.
//!
//! # Architecture
//!
//! - `registry.rs`: action enum, per-platform script paths
//! - `intent.rs`: free-text command parsing into an action + arguments

pub mod intent;
pub mod registry;

pub use intent::{parse_command_text, CommandIntent};
pub use registry::{
    Action, ActionDefinition, ActionRegistry, Platform, RequestedAction, ROTATE_CERTS,
};
