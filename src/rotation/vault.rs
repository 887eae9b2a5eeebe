//! Vault secret reads
//!
//! One authenticated `GET <addr>/v1/<path>` against a KV-style secret store.
//! Both the KV-v2 envelope (`data.data`) and flatter shapes are accepted.

use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::RotationError;

/// Default request timeout for vault reads
pub const DEFAULT_VAULT_TIMEOUT: Duration = Duration::from_secs(30);

const KEY_ALIASES: &[&str] = &["server_key", "key", "private_key"];
const CERT_ALIASES: &[&str] = &["server_cert", "cert"];
const CA_ALIASES: &[&str] = &["ca_cert", "ca"];

/// TLS material read from the vault
///
/// Held in memory only until it is written to the target files.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultSecret {
    pub server_key: String,
    pub server_cert: String,
    pub ca_cert: String,
}

impl fmt::Debug for VaultSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSecret")
            .field("server_key", &"<redacted>")
            .field("server_cert", &format_args!("{} bytes", self.server_cert.len()))
            .field("ca_cert", &format_args!("{} bytes", self.ca_cert.len()))
            .finish()
    }
}

impl VaultSecret {
    /// Extract the three PEM blobs from a vault JSON response
    ///
    /// Fails listing every canonical field that has no non-empty alias.
    pub fn from_response(body: &Value) -> Result<Self, RotationError> {
        let secret = secret_object(body);

        let server_key = first_present(secret, KEY_ALIASES);
        let server_cert = first_present(secret, CERT_ALIASES);
        let ca_cert = first_present(secret, CA_ALIASES);

        match (server_key, server_cert, ca_cert) {
            (Some(server_key), Some(server_cert), Some(ca_cert)) => Ok(Self {
                server_key,
                server_cert,
                ca_cert,
            }),
            (key, cert, ca) => {
                let mut missing = Vec::new();
                if key.is_none() {
                    missing.push("server_key");
                }
                if cert.is_none() {
                    missing.push("server_cert");
                }
                if ca.is_none() {
                    missing.push("ca_cert");
                }
                Err(RotationError::MissingFields(missing))
            }
        }
    }
}

/// The object holding the secret fields
fn secret_object(body: &Value) -> &Value {
    match body.get("data") {
        Some(data) => match data.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ if data.is_object() => data,
            _ => body,
        },
        None => body,
    }
}

fn first_present(secret: &Value, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|name| {
        secret
            .get(*name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Minimal vault HTTP client
pub struct VaultClient {
    client: reqwest::Client,
    addr: String,
    token: String,
}

impl fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultClient")
            .field("addr", &self.addr)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl VaultClient {
    pub fn new(
        addr: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RotationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RotationError::Http(e.to_string()))?;
        Ok(Self {
            client,
            addr: addr.into(),
            token: token.into(),
        })
    }

    /// Full URL of a secret path
    pub fn secret_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.addr.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Read and validate the TLS bundle stored at `path`
    pub async fn read_secret(&self, path: &str) -> Result<VaultSecret, RotationError> {
        let url = self.secret_url(path);
        debug!("Reading TLS material from {}", url);

        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| RotationError::Http(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RotationError::VaultStatus {
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RotationError::InvalidResponse(e.without_url().to_string()))?;

        VaultSecret::from_response(&body)
    }
}
