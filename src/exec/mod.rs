//! Command Execution Subsystem
//!
//! Runs whitelisted action scripts on behalf of authenticated callers.
//!
//! # Security Features
//!
//! - **Fixed Script Paths**: the script comes from the action registry, never
//!   from the request
//! - **List Invocation**: arguments are passed as an argv vector, never
//!   through a shell
//! - **Argument Filtering**: only strings in a restrictive charset survive
//! - **Timeout Enforcement**: a hung script is killed after the configured limit
//! - **Output Cap**: captured streams are bounded in size
//!
//! # Architecture
//!
//! - `sanitize.rs`: argument charset filtering
//! - `executor.rs`: child-process execution with timeout and capture

mod executor;
mod sanitize;

pub use executor::{
    ExecutionError, ExecutorConfig, ScriptExecutor, ScriptOutput, ScriptRunner,
    DEFAULT_TIMEOUT_SECS, MAX_OUTPUT_SIZE,
};
pub use sanitize::{args_from_params, filter_safe, is_safe_arg, sanitize_args};
