// Configuration File Support
//
// Configuration for the agentgate control plane. An optional TOML file is
// loaded first, then environment variables override individual settings.
// The environment names match the ones deployment agents already use
// (AGENT_SHARED_SECRET, MTLS_REQUIRED, VAULT_ADDR, ...).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::actions::Action;
use crate::rotation::RotationTarget;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "AGENTGATE_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,

    /// Caller authentication
    pub auth: AuthConfig,

    /// Nonce and timestamp checks
    pub replay: ReplayConfig,

    /// Auto-execution limits
    pub circuit: CircuitConfig,

    /// Script execution
    pub executor: ExecutorSettings,

    /// Server TLS material
    pub tls: TlsConfig,

    /// Secrets vault used for certificate rotation
    pub vault: VaultConfig,

    /// Audit trail
    pub audit: AuditConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,

    /// Maximum accepted request body in bytes
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
            body_limit_bytes: 1024 * 1024,
        }
    }
}

/// Caller authentication
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC key shared with deployment agents
    pub shared_secret: Option<String>,

    /// Terminate TLS and authenticate by client certificate
    pub mtls_required: bool,

    /// Client certificate Common Names allowed in (empty allows any trusted cert)
    pub mtls_client_cn_allowlist: Vec<String>,

    /// Accept a valid HMAC for automatic text-command execution
    pub auto_allow_hmac: bool,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("shared_secret", &redacted(&self.shared_secret))
            .field("mtls_required", &self.mtls_required)
            .field("mtls_client_cn_allowlist", &self.mtls_client_cn_allowlist)
            .field("auto_allow_hmac", &self.auto_allow_hmac)
            .finish()
    }
}

/// Nonce and timestamp checks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplayConfig {
    /// How long an accepted nonce is remembered
    pub nonce_ttl_secs: u64,

    /// Allowed distance between request timestamp and server clock
    pub timestamp_tolerance_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            nonce_ttl_secs: 300,
            timestamp_tolerance_secs: 300,
        }
    }
}

/// Auto-execution limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitConfig {
    /// Executions admitted per action per window
    pub max: u32,

    /// Window length in seconds
    pub window_secs: u64,

    /// Actions a text command may execute automatically
    pub auto_allowed_actions: Vec<String>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max: 3,
            window_secs: 600,
            auto_allowed_actions: vec!["restart_service".to_string(), "fetch_logs".to_string()],
        }
    }
}

/// Script execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Directory holding the action scripts
    pub scripts_dir: PathBuf,

    /// Per-run timeout in seconds
    pub timeout_secs: u64,

    /// Captured bytes per output stream
    pub max_output_bytes: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("scripts"),
            timeout_secs: 60,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Server TLS material
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    pub key_path: Option<String>,
    pub cert_path: Option<String>,
    pub ca_path: Option<String>,
}

/// Secrets vault used for certificate rotation
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    pub addr: Option<String>,
    pub token: Option<String>,

    /// KV path of the TLS bundle, e.g. `secret/data/certs/server`
    pub cert_path: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            addr: None,
            token: None,
            cert_path: None,
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("addr", &self.addr)
            .field("token", &redacted(&self.token))
            .field("cert_path", &self.cert_path)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Audit trail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Newline-delimited JSON log file
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/management.log"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve /metrics
    pub enabled: bool,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

fn redacted(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "<redacted>")
}

/// Comma-separated list, trimmed, empties dropped
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

impl Config {
    /// Load configuration from `path`, or from `AGENTGATE_CONFIG`, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => match std::env::var(CONFIG_ENV) {
                Ok(path) if !path.is_empty() => Self::load_from_path(path),
                _ => {
                    let config = Self::default().apply_env_overrides();
                    config.validate()?;
                    Ok(config)
                }
            },
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the result fails validation. A missing file yields defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(self) -> Self {
        self.apply_env_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides using `lookup` to read variables
    ///
    /// Unparseable numeric values are ignored and the current setting kept.
    pub fn apply_env_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Listener
        if let Some(bind) = lookup("AGENTGATE_BIND") {
            self.server.bind = bind;
        }

        // Authentication
        if let Some(secret) = lookup("AGENT_SHARED_SECRET") {
            self.auth.shared_secret = non_empty(secret);
        }
        if let Some(required) = lookup("MTLS_REQUIRED") {
            self.auth.mtls_required = required.trim().eq_ignore_ascii_case("true");
        }
        if let Some(list) = lookup("MTLS_CLIENT_CN_ALLOWLIST") {
            self.auth.mtls_client_cn_allowlist = split_list(&list);
        }
        if let Some(allow) = lookup("AUTO_ALLOW_HMAC") {
            self.auth.auto_allow_hmac = allow.trim().eq_ignore_ascii_case("true");
        }

        // Replay guard
        if let Some(ttl) = lookup("NONCE_TTL_SECS").and_then(|v| v.trim().parse().ok()) {
            self.replay.nonce_ttl_secs = ttl;
        }
        if let Some(tolerance) =
            lookup("TIMESTAMP_TOLERANCE_SECONDS").and_then(|v| v.trim().parse().ok())
        {
            self.replay.timestamp_tolerance_secs = tolerance;
        }

        // Circuit breaker
        if let Some(actions) = lookup("AUTO_ALLOWED_ACTIONS") {
            self.circuit.auto_allowed_actions = split_list(&actions);
        }
        if let Some(max) = lookup("AUTO_CIRCUIT_MAX").and_then(|v| v.trim().parse().ok()) {
            self.circuit.max = max;
        }
        if let Some(window) = lookup("AUTO_CIRCUIT_WINDOW").and_then(|v| v.trim().parse().ok()) {
            self.circuit.window_secs = window;
        }

        // Executor
        if let Some(dir) = lookup("AGENTGATE_SCRIPTS_DIR") {
            self.executor.scripts_dir = PathBuf::from(dir);
        }
        if let Some(timeout) =
            lookup("AGENTGATE_SCRIPT_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok())
        {
            self.executor.timeout_secs = timeout;
        }

        // TLS material
        if let Some(path) = lookup("MTLS_SERVER_KEY_PATH") {
            self.tls.key_path = non_empty(path);
        }
        if let Some(path) = lookup("MTLS_SERVER_CERT_PATH") {
            self.tls.cert_path = non_empty(path);
        }
        if let Some(path) = lookup("MTLS_CA_PATH") {
            self.tls.ca_path = non_empty(path);
        }

        // Vault
        if let Some(addr) = lookup("VAULT_ADDR") {
            self.vault.addr = non_empty(addr);
        }
        if let Some(token) = lookup("VAULT_TOKEN") {
            self.vault.token = non_empty(token);
        }
        if let Some(path) = lookup("VAULT_CERT_PATH") {
            self.vault.cert_path = non_empty(path);
        }

        // Audit
        if let Some(path) = lookup("AGENTGATE_AUDIT_LOG") {
            self.audit.path = PathBuf::from(path);
        }

        // Logging
        if let Some(level) = lookup("AGENTGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("AGENTGATE_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Metrics
        if let Some(enabled) = lookup("AGENTGATE_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Some(port) = lookup("AGENTGATE_METRICS_PORT").and_then(|v| v.parse().ok()) {
            self.metrics.port = port;
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        // Validate circuit breaker
        if self.circuit.max == 0 {
            anyhow::bail!("Auto-exec circuit max must be > 0");
        }
        if self.circuit.window_secs == 0 {
            anyhow::bail!("Auto-exec circuit window must be > 0 seconds");
        }
        for name in &self.circuit.auto_allowed_actions {
            if Action::from_name(name).is_none() {
                anyhow::bail!("Unknown action in auto-exec allowlist: {}", name);
            }
        }

        // Validate executor
        if self.executor.timeout_secs == 0 {
            anyhow::bail!("Script timeout must be > 0 seconds");
        }

        // Validate mTLS
        if self.auth.mtls_required && self.tls_paths().is_none() {
            anyhow::bail!(
                "mTLS is required but MTLS_SERVER_KEY_PATH, MTLS_SERVER_CERT_PATH and MTLS_CA_PATH are not all set"
            );
        }

        // Validate metrics configuration
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// TLS material paths, when all three are configured
    pub fn tls_paths(&self) -> Option<crate::tls::TlsPaths> {
        match (&self.tls.key_path, &self.tls.cert_path, &self.tls.ca_path) {
            (Some(key), Some(cert), Some(ca)) => Some(crate::tls::TlsPaths::new(key, cert, ca)),
            _ => None,
        }
    }

    /// Parsed auto-exec allowlist
    pub fn auto_allowed_actions(&self) -> Vec<Action> {
        self.circuit
            .auto_allowed_actions
            .iter()
            .filter_map(|name| Action::from_name(name))
            .collect()
    }

    /// Vault path shown in rotation suggestions
    pub fn vault_path_label(&self) -> String {
        self.vault
            .cert_path
            .clone()
            .unwrap_or_else(|| "<not-configured>".to_string())
    }

    /// Everything the certificate rotator needs (empty where unset)
    pub fn rotation_target(&self) -> RotationTarget {
        let or_empty = |v: &Option<String>| v.clone().unwrap_or_default();
        RotationTarget {
            vault_addr: or_empty(&self.vault.addr),
            vault_token: or_empty(&self.vault.token),
            vault_path: or_empty(&self.vault.cert_path),
            key_path: or_empty(&self.tls.key_path),
            cert_path: or_empty(&self.tls.cert_path),
            ca_path: or_empty(&self.tls.ca_path),
        }
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.replay.nonce_ttl_secs)
    }

    pub fn circuit_window(&self) -> Duration {
        Duration::from_secs(self.circuit.window_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.timeout_secs)
    }

    pub fn vault_timeout(&self) -> Duration {
        Duration::from_secs(self.vault.timeout_secs)
    }
}
