//! TLS peer identity
//!
//! Extracts the Common Name and fingerprint of a client certificate so the
//! authenticator can apply the CN allowlist and the audit log can record who
//! called.

use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Identity of the client on the other end of a TLS connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Whether the TLS stack verified the chain against the trusted CA
    pub authorized: bool,

    /// Subject Common Name of the leaf certificate
    pub common_name: Option<String>,

    /// SHA-256 of the leaf certificate DER, colon-separated uppercase hex
    pub fingerprint: Option<String>,
}

impl PeerIdentity {
    /// Identity from a presented chain (leaf first)
    ///
    /// Returns `None` when the chain is empty.
    pub fn from_certificate_chain(chain: &[CertificateDer<'_>], authorized: bool) -> Option<Self> {
        let leaf = chain.first()?;
        Some(Self {
            authorized,
            common_name: common_name(leaf.as_ref()),
            fingerprint: Some(fingerprint(leaf.as_ref())),
        })
    }

    /// A verified peer with the given Common Name
    pub fn verified(common_name: impl Into<String>) -> Self {
        Self {
            authorized: true,
            common_name: Some(common_name.into()),
            fingerprint: None,
        }
    }
}

/// Subject CN of a DER certificate, if it parses and has one
pub fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = match x509_parser::parse_x509_certificate(der) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Failed to parse peer certificate: {}", e);
            return None;
        }
    };

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    cn
}

/// Colon-separated SHA-256 fingerprint of DER bytes
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
