//! Control Plane Error Types
//!
//! This module defines the error taxonomy surfaced to remote callers. Each
//! variant maps to exactly one HTTP status and one public message; internal
//! detail (signatures, secrets, stack context) never leaves the process.

use axum::http::StatusCode;

use crate::exec::ExecutionError;
use crate::rotation::RotationError;

/// Errors that terminate a command request
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Bad or missing signature, untrusted or disallowed client certificate
    #[error("invalid auth")]
    AuthenticationFailure,

    /// Stale timestamp, reused nonce, or malformed timestamp
    #[error("invalid or replayed request")]
    ReplayOrStale,

    /// Body could not be decoded after authentication succeeded
    #[error("malformed request")]
    MalformedRequest,

    /// Free-text command did not match any known intent
    #[error("unknown command")]
    UnknownCommand,

    /// Action is neither whitelisted nor `rotate_certs`
    #[error("action not allowed")]
    ActionNotAllowed,

    /// Action is whitelisted but not enabled for automatic execution
    #[error("action not allowed for auto-exec")]
    AutoExecNotAllowed,

    /// Caller identity is insufficient for automatic execution
    #[error("not authorized for auto-exec")]
    AutoExecUnauthorized,

    /// Circuit breaker is open for this action
    #[error("auto-exec circuit open")]
    RateLimited,

    /// Script failed, timed out or could not be spawned
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Vault read, payload validation or file replacement failed
    #[error(transparent)]
    Rotation(#[from] RotationError),
}

impl ControlError {
    /// HTTP status returned to the caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::AuthenticationFailure
            | ControlError::ActionNotAllowed
            | ControlError::AutoExecNotAllowed
            | ControlError::AutoExecUnauthorized => StatusCode::FORBIDDEN,
            ControlError::ReplayOrStale
            | ControlError::MalformedRequest
            | ControlError::UnknownCommand => StatusCode::BAD_REQUEST,
            ControlError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ControlError::Execution(_) | ControlError::Rotation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::AuthenticationFailure => "auth_failed",
            ControlError::ReplayOrStale => "replay",
            ControlError::MalformedRequest => "malformed",
            ControlError::UnknownCommand => "unknown_command",
            ControlError::ActionNotAllowed => "action_denied",
            ControlError::AutoExecNotAllowed => "auto_exec_denied",
            ControlError::AutoExecUnauthorized => "auto_exec_unauthorized",
            ControlError::RateLimited => "rate_limited",
            ControlError::Execution(_) => "execution_failed",
            ControlError::Rotation(_) => "rotation_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(
            ControlError::AuthenticationFailure.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ControlError::ReplayOrStale.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ControlError::ActionNotAllowed.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ControlError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ControlError::Rotation(RotationError::MissingFields(vec!["ca_cert"])).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_public_messages() {
        assert_eq!(ControlError::AuthenticationFailure.to_string(), "invalid auth");
        assert_eq!(
            ControlError::ReplayOrStale.to_string(),
            "invalid or replayed request"
        );
        assert_eq!(ControlError::ActionNotAllowed.to_string(), "action not allowed");
        assert_eq!(ControlError::RateLimited.to_string(), "auto-exec circuit open");
    }
}
