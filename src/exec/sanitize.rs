//! Argument Sanitization
//!
//! Script arguments arrive as arbitrary JSON. Only strings made entirely of
//! alphanumerics and `. _ - \ / : @` are forwarded to the child process;
//! everything else is dropped without error.

use serde_json::Value;
use tracing::debug;

/// Whether every character of `arg` is in the allowed set
///
/// The empty string is rejected.
pub fn is_safe_arg(arg: &str) -> bool {
    !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '\\' | '/' | ':' | '@'))
}

/// Keep the safe string elements of a JSON argument list, in order
pub fn sanitize_args(args: &[Value]) -> Vec<String> {
    let mut kept = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::String(s) if is_safe_arg(s) => kept.push(s.clone()),
            _ => debug!("Dropping unsafe script argument"),
        }
    }
    kept
}

/// Arguments from a request `params` value
///
/// Accepts `{"args": [...]}` or a bare array; anything else yields no args.
pub fn args_from_params(params: &Value) -> Vec<String> {
    match params {
        Value::Array(items) => sanitize_args(items),
        Value::Object(map) => match map.get("args") {
            Some(Value::Array(items)) => sanitize_args(items),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Filter an already-stringly argument list
pub fn filter_safe<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    args.iter()
        .map(AsRef::as_ref)
        .filter(|a| is_safe_arg(a))
        .map(str::to_string)
        .collect()
}
