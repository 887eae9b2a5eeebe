//! Certificate Rotation
//!
//! Pulls a server key, server certificate and CA certificate from a secrets
//! vault, replaces the on-disk trust bundle all-or-nothing, and asks the host
//! to reload its TLS context.
//!
//! # Architecture
//!
//! - `vault.rs`: HTTP read and response-shape handling
//! - `writer.rs`: staged temp files + ordered renames with rollback
//! - `reload.rs`: the reload capability handed in by the host

pub mod reload;
pub mod vault;
pub mod writer;

pub use reload::ReloadHook;
pub use vault::{VaultClient, VaultSecret, DEFAULT_VAULT_TIMEOUT};
pub use writer::BundlePaths;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::metrics::ROTATIONS_TOTAL;

/// Errors that abort a rotation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RotationError {
    #[error("vault or cert paths not configured")]
    NotConfigured,

    #[error("vault request failed: {0}")]
    Http(String),

    #[error("vault returned HTTP {status}")]
    VaultStatus { status: u16 },

    #[error("vault response is not valid JSON: {0}")]
    InvalidResponse(String),

    #[error("vault response missing keys: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("failed to read current {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("failed to write {}: {message}", path.display())]
    Write { path: PathBuf, message: String },

    #[error("failed to replace {}: {message}", path.display())]
    Rename { path: PathBuf, message: String },

    #[error("rotation task failed: {0}")]
    Task(String),
}

/// Where to read the bundle from and where to write it
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RotationTarget {
    pub vault_addr: String,
    pub vault_token: String,
    pub vault_path: String,
    pub key_path: String,
    pub cert_path: String,
    pub ca_path: String,
}

impl std::fmt::Debug for RotationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationTarget")
            .field("vault_addr", &self.vault_addr)
            .field("vault_token", &"<redacted>")
            .field("vault_path", &self.vault_path)
            .field("key_path", &self.key_path)
            .field("cert_path", &self.cert_path)
            .field("ca_path", &self.ca_path)
            .finish()
    }
}

impl RotationTarget {
    /// All six settings are non-empty
    pub fn is_complete(&self) -> bool {
        [
            &self.vault_addr,
            &self.vault_token,
            &self.vault_path,
            &self.key_path,
            &self.cert_path,
            &self.ca_path,
        ]
        .iter()
        .all(|s| !s.trim().is_empty())
    }
}

/// Result of a successful rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationOutcome {
    /// New material is in place on disk
    pub rotated: bool,

    /// The reload hook reported the new context is live
    pub reloaded: bool,
}

/// Vault-backed trust-bundle rotator
pub struct CertRotator {
    timeout: Duration,
    reload_hook: Option<Arc<dyn ReloadHook>>,

    /// Held from the first file write until the reload hook returns
    install_lock: Mutex<()>,
}

impl std::fmt::Debug for CertRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertRotator")
            .field("timeout", &self.timeout)
            .field("reload_hook", &self.reload_hook.is_some())
            .finish()
    }
}

impl Default for CertRotator {
    fn default() -> Self {
        Self::new(DEFAULT_VAULT_TIMEOUT)
    }
}

impl CertRotator {
    /// Rotator whose vault reads give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            reload_hook: None,
            install_lock: Mutex::new(()),
        }
    }

    /// Register the capability that swaps the live TLS context
    pub fn with_reload_hook(mut self, hook: Arc<dyn ReloadHook>) -> Self {
        self.reload_hook = Some(hook);
        self
    }

    pub fn has_reload_hook(&self) -> bool {
        self.reload_hook.is_some()
    }

    /// Rotate using a configured target
    pub async fn rotate(&self, target: &RotationTarget) -> Result<RotationOutcome, RotationError> {
        self.rotate_certs_from_vault(
            &target.vault_addr,
            &target.vault_token,
            &target.vault_path,
            &target.key_path,
            &target.cert_path,
            &target.ca_path,
        )
        .await
    }

    /// Fetch the bundle at `vault_path`, install it, and reload
    ///
    /// Fails before any network or file activity unless all six arguments
    /// are non-empty. Concurrent rotations fetch in parallel but install and
    /// reload one at a time, so the files on disk always form one bundle.
    pub async fn rotate_certs_from_vault(
        &self,
        vault_addr: &str,
        vault_token: &str,
        vault_path: &str,
        key_path: &str,
        cert_path: &str,
        ca_path: &str,
    ) -> Result<RotationOutcome, RotationError> {
        let result = self
            .run(vault_addr, vault_token, vault_path, key_path, cert_path, ca_path)
            .await;

        match &result {
            Ok(outcome) => {
                info!(
                    reloaded = outcome.reloaded,
                    "Rotated TLS material from vault path {}", vault_path
                );
                ROTATIONS_TOTAL.with_label_values(&["success"]).inc();
            }
            Err(e) => {
                warn!("Certificate rotation failed: {}", e);
                ROTATIONS_TOTAL.with_label_values(&["failure"]).inc();
            }
        }
        result
    }

    async fn run(
        &self,
        vault_addr: &str,
        vault_token: &str,
        vault_path: &str,
        key_path: &str,
        cert_path: &str,
        ca_path: &str,
    ) -> Result<RotationOutcome, RotationError> {
        let target = RotationTarget {
            vault_addr: vault_addr.to_string(),
            vault_token: vault_token.to_string(),
            vault_path: vault_path.to_string(),
            key_path: key_path.to_string(),
            cert_path: cert_path.to_string(),
            ca_path: ca_path.to_string(),
        };
        if !target.is_complete() {
            return Err(RotationError::NotConfigured);
        }

        let client = VaultClient::new(vault_addr, vault_token, self.timeout)?;
        let secret = client.read_secret(vault_path).await?;

        let _guard = self.install_lock.lock().await;

        let paths = BundlePaths::new(key_path, cert_path, ca_path);
        tokio::task::spawn_blocking(move || paths.write_bundle_atomically(&secret))
            .await
            .map_err(|e| RotationError::Task(e.to_string()))??;

        let reloaded = match &self.reload_hook {
            Some(hook) => {
                let hook = hook.clone();
                tokio::task::spawn_blocking(move || hook.reload())
                    .await
                    .unwrap_or(false)
            }
            None => false,
        };

        Ok(RotationOutcome {
            rotated: true,
            reloaded,
        })
    }
}
