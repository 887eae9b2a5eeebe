//! Command Handler
//!
//! Drives one command request through the gates and into a suggestion or an
//! execution:
//!
//! ```text
//! received -> suggested                       (auto_execute = false)
//! received -> executing -> finished           (auto_execute = true)
//! ```
//!
//! Handshake requests pass authentication, replay and action checks before
//! `received` is audited. Text commands are parsed first and authenticated
//! only when they ask for automatic execution. Every entry into a stage is
//! appended to the audit log; rejections before `received` go to tracing and
//! metrics only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::actions::{parse_command_text, Action, RequestedAction};
use crate::audit::{AuditLog, AuditStage, AuditTrail, ClientSummary};
use crate::auth::{Authenticator, PeerIdentity};
use crate::config::Config;
use crate::error::ControlError;
use crate::exec::{args_from_params, ScriptRunner};
use crate::guard::{CircuitBreaker, CircuitDecision, ReplayGuard};
use crate::metrics::{self, AUTH_FAILURES_TOTAL, CIRCUIT_TRIPS_TOTAL, NONCE_STORE_SIZE, REPLAY_REJECTIONS_TOTAL};
use crate::rotation::{CertRotator, RotationTarget};

/// Metrics label of the structured endpoint
pub const HANDSHAKE: &str = "handshake";

/// Metrics label of the free-text endpoint
pub const COMMAND: &str = "command";

/// Transport facts about the connection a request arrived on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,

    /// Present only on TLS connections that presented a client certificate
    pub peer: Option<PeerIdentity>,
}

impl ConnectionInfo {
    pub fn new(remote_addr: Option<SocketAddr>, peer: Option<PeerIdentity>) -> Self {
        Self { remote_addr, peer }
    }

    /// Caller IP as recorded in the audit log
    pub fn origin(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.ip().to_string())
    }

    fn client_summary(&self) -> Option<ClientSummary> {
        self.peer.as_ref().map(ClientSummary::from)
    }
}

/// Body of `POST /api/management/handshake`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommandRequest {
    pub id: Option<Value>,
    pub nonce: Option<Value>,
    pub timestamp: Option<Value>,
    pub action: Option<Value>,
    pub params: Value,
    pub auto_execute: bool,
}

/// Body of `POST /api/management/command`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TextCommandRequest {
    pub id: Option<Value>,
    pub nonce: Option<Value>,
    pub timestamp: Option<Value>,
    pub text: Option<Value>,
    pub auto_execute: bool,
}

/// Correlation id as a string, whatever JSON type the caller used
fn correlation_id(id: &Option<Value>) -> Option<String> {
    match id {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// HTTP status and JSON body returned to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl CommandResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    /// `{error}` with the taxonomy status; script failures carry their output
    pub fn from_error(err: &ControlError) -> Self {
        let mut body = json!({ "error": err.to_string() });
        if let ControlError::Execution(e) = err {
            body["output"] = json!(e.output());
        }
        Self {
            status: err.status_code(),
            body,
        }
    }
}

impl IntoResponse for CommandResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Orchestrates authentication, replay protection, policy and execution
pub struct CommandHandler {
    authenticator: Authenticator,
    replay: Arc<ReplayGuard>,
    circuit: Arc<CircuitBreaker>,
    runner: Arc<dyn ScriptRunner>,
    rotator: Arc<CertRotator>,
    audit: Arc<AuditLog>,
    rotation_target: RotationTarget,
    vault_path_label: String,
    auto_allowed: HashSet<Action>,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("authenticator", &self.authenticator)
            .field("audit", &self.audit.path())
            .field("auto_allowed", &self.auto_allowed)
            .finish_non_exhaustive()
    }
}

impl CommandHandler {
    /// Build a handler with fresh replay and circuit state
    pub fn from_config(
        config: &Config,
        runner: Arc<dyn ScriptRunner>,
        rotator: Arc<CertRotator>,
    ) -> Self {
        let authenticator = Authenticator::new(
            config.auth.shared_secret.clone(),
            config.auth.mtls_required,
            config.auth.mtls_client_cn_allowlist.clone(),
        )
        .with_auto_allow_hmac(config.auth.auto_allow_hmac);

        Self {
            authenticator,
            replay: Arc::new(ReplayGuard::new(
                config.nonce_ttl(),
                config.replay.timestamp_tolerance_secs,
            )),
            circuit: Arc::new(CircuitBreaker::new(config.circuit.max, config.circuit_window())),
            runner,
            rotator,
            audit: Arc::new(AuditLog::new(config.audit.path.clone())),
            rotation_target: config.rotation_target(),
            vault_path_label: config.vault_path_label(),
            auto_allowed: config.auto_allowed_actions().into_iter().collect(),
        }
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Structured command: authenticate, check freshness, then suggest or run
    pub async fn handle_handshake(
        &self,
        conn: &ConnectionInfo,
        raw: &[u8],
        signature: Option<&str>,
    ) -> CommandResponse {
        if let Err(e) = self.authenticator.verify(raw, signature, conn.peer.as_ref()) {
            warn!(origin = ?conn.origin(), "Rejected handshake: {}", e);
            AUTH_FAILURES_TOTAL.with_label_values(&[HANDSHAKE]).inc();
            return reject(HANDSHAKE, "unknown", ControlError::AuthenticationFailure);
        }

        let request: CommandRequest = match serde_json::from_slice(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("Handshake body did not parse: {}", e);
                return reject(HANDSHAKE, "unknown", ControlError::MalformedRequest);
            }
        };

        if let Err(response) = self.check_replay(HANDSHAKE, &request.nonce, &request.timestamp) {
            return response;
        }

        let requested = match request
            .action
            .as_ref()
            .and_then(Value::as_str)
            .and_then(RequestedAction::parse)
        {
            Some(requested) => requested,
            None => {
                warn!(origin = ?conn.origin(), action = ?request.action, "Action not allowed");
                return reject(HANDSHAKE, "unknown", ControlError::ActionNotAllowed);
            }
        };

        let request_id = correlation_id(&request.id);
        info!(
            request_id = ?request_id,
            action = %requested.name(),
            auto_execute = request.auto_execute,
            "Handshake received"
        );
        let trail = AuditTrail::new(request_id, conn.origin(), conn.client_summary())
            .with_action(requested.name())
            .with_params(request.params.clone());
        self.audit.record(&trail.entry(AuditStage::Received)).await;

        match requested {
            RequestedAction::RotateCerts => {
                let suggestion = json!({
                    "method": "vault_pull",
                    "vault_path": self.vault_path_label,
                });
                if !request.auto_execute {
                    return self.suggest(HANDSHAKE, requested.name(), &trail, suggestion).await;
                }
                // Rotation is not subject to the circuit breaker
                self.rotate(&trail).await
            }
            RequestedAction::Script(action) => {
                let args = args_from_params(&request.params);
                let suggestion = json!({
                    "platform": self.runner.platform().os_name(),
                    "script": self.runner.script_path(action).display().to_string(),
                    "args": args,
                });
                if !request.auto_execute {
                    return self.suggest(HANDSHAKE, action.name(), &trail, suggestion).await;
                }
                if let Err(response) = self.acquire_circuit(HANDSHAKE, action, &trail).await {
                    return response;
                }
                self.execute(HANDSHAKE, action, &args, &trail).await
            }
        }
    }

    /// Free-text command: parse, check freshness, then suggest or run
    ///
    /// Automatic execution additionally requires the action to be in the
    /// auto-exec allowlist and the caller to be auto-exec authorised.
    pub async fn handle_text_command(
        &self,
        conn: &ConnectionInfo,
        raw: &[u8],
        signature: Option<&str>,
    ) -> CommandResponse {
        let request: TextCommandRequest = match serde_json::from_slice(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("Command body did not parse: {}", e);
                return reject(COMMAND, "unknown", ControlError::MalformedRequest);
            }
        };

        let text = request
            .text
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or_default();
        let intent = match parse_command_text(text) {
            Some(intent) => intent,
            None => return reject(COMMAND, "unknown", ControlError::UnknownCommand),
        };
        let action = intent.action;

        if let Err(response) = self.check_replay(COMMAND, &request.nonce, &request.timestamp) {
            return response;
        }

        let request_id = correlation_id(&request.id);
        info!(
            request_id = ?request_id,
            action = %action,
            auto_execute = request.auto_execute,
            "Text command received"
        );
        let trail = AuditTrail::new(request_id, conn.origin(), conn.client_summary())
            .with_text(text)
            .with_action(action.name())
            .with_params(json!({ "args": intent.args }));
        self.audit.record(&trail.entry(AuditStage::Received)).await;

        if !request.auto_execute {
            let suggestion = json!({
                "action": action.name(),
                "params": { "args": intent.args },
            });
            return self.suggest(COMMAND, action.name(), &trail, suggestion).await;
        }

        if !self.auto_allowed.contains(&action) {
            return self
                .finish_rejected(COMMAND, action.name(), &trail, ControlError::AutoExecNotAllowed)
                .await;
        }

        if let Err(e) =
            self.authenticator
                .verify_auto_exec(raw, signature, conn.peer.as_ref())
        {
            warn!(origin = ?conn.origin(), action = %action, "Auto-exec not authorised: {}", e);
            AUTH_FAILURES_TOTAL.with_label_values(&[COMMAND]).inc();
            return self
                .finish_rejected(COMMAND, action.name(), &trail, ControlError::AutoExecUnauthorized)
                .await;
        }

        if let Err(response) = self.acquire_circuit(COMMAND, action, &trail).await {
            return response;
        }
        self.execute(COMMAND, action, &intent.args, &trail).await
    }

    fn check_replay(
        &self,
        endpoint: &str,
        nonce: &Option<Value>,
        timestamp: &Option<Value>,
    ) -> Result<(), CommandResponse> {
        let nonce = nonce.as_ref().and_then(Value::as_str);
        let result = self.replay.check(nonce, timestamp.as_ref());
        NONCE_STORE_SIZE.set(self.replay.len() as i64);

        result.map_err(|e| {
            debug!("Replay check failed: {}", e);
            REPLAY_REJECTIONS_TOTAL.inc();
            reject(endpoint, "unknown", ControlError::ReplayOrStale)
        })
    }

    async fn suggest(
        &self,
        endpoint: &str,
        action: &str,
        trail: &AuditTrail,
        suggestion: Value,
    ) -> CommandResponse {
        self.audit
            .record(&trail.entry(AuditStage::Suggested).with_suggestion(suggestion.clone()))
            .await;
        metrics::record_command(endpoint, action, "suggested");
        CommandResponse::ok(json!({ "status": "suggested", "suggestion": suggestion }))
    }

    async fn acquire_circuit(
        &self,
        endpoint: &str,
        action: Action,
        trail: &AuditTrail,
    ) -> Result<(), CommandResponse> {
        match self.circuit.try_acquire(action.name()) {
            CircuitDecision::Allowed { count, remaining } => {
                debug!(action = %action, count, remaining, "Circuit admitted auto-execution");
                Ok(())
            }
            CircuitDecision::Open { retry_after_secs } => {
                warn!(action = %action, retry_after_secs, "Auto-exec circuit open");
                CIRCUIT_TRIPS_TOTAL.with_label_values(&[action.name()]).inc();
                Err(self
                    .finish_rejected(endpoint, action.name(), trail, ControlError::RateLimited)
                    .await)
            }
        }
    }

    async fn execute(
        &self,
        endpoint: &str,
        action: Action,
        args: &[String],
        trail: &AuditTrail,
    ) -> CommandResponse {
        self.audit.record(&trail.entry(AuditStage::Executing)).await;

        match self.runner.run_script_safe(action, args).await {
            Ok(output) => {
                info!(action = %action, "Action completed");
                let output = json!(output);
                self.audit
                    .record(&trail.entry(AuditStage::Finished).with_output(output.clone()))
                    .await;
                metrics::record_command(endpoint, action.name(), "ok");
                CommandResponse::ok(json!({ "status": "ok", "output": output }))
            }
            Err(e) => {
                warn!(action = %action, "Action failed: {}", e);
                let output = json!(e.output());
                self.audit
                    .record(
                        &trail
                            .entry(AuditStage::Finished)
                            .with_error(e.to_string())
                            .with_output(output),
                    )
                    .await;
                let err = ControlError::from(e);
                metrics::record_command(endpoint, action.name(), err.kind());
                CommandResponse::from_error(&err)
            }
        }
    }

    async fn rotate(&self, trail: &AuditTrail) -> CommandResponse {
        self.audit.record(&trail.entry(AuditStage::Executing)).await;

        match self.rotator.rotate(&self.rotation_target).await {
            Ok(outcome) => {
                let result = json!(outcome);
                self.audit
                    .record(&trail.entry(AuditStage::Finished).with_result(result.clone()))
                    .await;
                metrics::record_command(HANDSHAKE, crate::actions::ROTATE_CERTS, "ok");
                CommandResponse::ok(json!({ "status": "ok", "result": result }))
            }
            Err(e) => {
                self.audit
                    .record(&trail.entry(AuditStage::Finished).with_error(e.to_string()))
                    .await;
                let err = ControlError::from(e);
                metrics::record_command(HANDSHAKE, crate::actions::ROTATE_CERTS, err.kind());
                CommandResponse::from_error(&err)
            }
        }
    }

    /// Terminal policy rejection after `received` was audited
    async fn finish_rejected(
        &self,
        endpoint: &str,
        action: &str,
        trail: &AuditTrail,
        err: ControlError,
    ) -> CommandResponse {
        self.audit
            .record(&trail.entry(AuditStage::Finished).with_error(err.to_string()))
            .await;
        reject(endpoint, action, err)
    }
}

fn reject(endpoint: &str, action: &str, err: ControlError) -> CommandResponse {
    metrics::record_command(endpoint, action, err.kind());
    CommandResponse::from_error(&err)
}
