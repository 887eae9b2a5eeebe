//! Caller Authentication
//!
//! Decides whether the sender of a command request is trusted. Two modes:
//!
//! - **mTLS**: the TLS stack must have verified the client certificate, and
//!   when a Common Name allowlist is configured the certificate CN must be
//!   on it. The request body is not consulted.
//! - **HMAC**: the `x-signature` header must carry HMAC-SHA256 of the raw
//!   body under the shared secret.
//!
//! Verification is pure. Failures come back as [`AuthError`] so the caller
//! can log the reason while returning one generic message to the client.

pub mod hmac;
pub mod peer;

pub use self::hmac::{
    sign, signature_header_value, verify_signature, SIGNATURE_HEADER, SIGNATURE_PREFIX,
};
pub use self::peer::PeerIdentity;

use std::collections::HashSet;
use std::fmt;

/// Why a caller was not trusted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no client certificate presented")]
    MissingPeer,

    #[error("client certificate not verified by the trusted CA")]
    PeerNotAuthorized,

    #[error("client certificate has no Common Name")]
    MissingPeerCommonName,

    #[error("client certificate CN '{0}' is not allowlisted")]
    CommonNameNotAllowed(String),

    #[error("shared secret is not configured")]
    SecretNotConfigured,

    #[error("signature header is missing")]
    MissingSignature,

    #[error("signature does not match request body")]
    SignatureMismatch,
}

/// Verifies callers by mTLS identity or HMAC signature
#[derive(Clone)]
pub struct Authenticator {
    shared_secret: Option<Vec<u8>>,
    mtls_required: bool,
    cn_allowlist: HashSet<String>,
    auto_allow_hmac: bool,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field(
                "shared_secret",
                &self.shared_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("mtls_required", &self.mtls_required)
            .field("cn_allowlist", &self.cn_allowlist)
            .field("auto_allow_hmac", &self.auto_allow_hmac)
            .finish()
    }
}

impl Authenticator {
    /// Build an authenticator
    ///
    /// An empty secret is treated as unconfigured.
    pub fn new(
        shared_secret: Option<String>,
        mtls_required: bool,
        cn_allowlist: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            shared_secret: shared_secret
                .filter(|s| !s.is_empty())
                .map(String::into_bytes),
            mtls_required,
            cn_allowlist: cn_allowlist
                .into_iter()
                .map(|cn| cn.trim().to_string())
                .filter(|cn| !cn.is_empty())
                .collect(),
            auto_allow_hmac: false,
        }
    }

    /// Allow a valid HMAC to authorise automatic text-command execution
    pub fn with_auto_allow_hmac(mut self, enabled: bool) -> Self {
        self.auto_allow_hmac = enabled;
        self
    }

    pub fn mtls_required(&self) -> bool {
        self.mtls_required
    }

    pub fn has_shared_secret(&self) -> bool {
        self.shared_secret.is_some()
    }

    /// Authenticate a request
    ///
    /// With mTLS enforced only the peer is checked; otherwise only the
    /// signature is.
    pub fn verify(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        peer: Option<&PeerIdentity>,
    ) -> Result<(), AuthError> {
        if self.mtls_required {
            self.verify_peer(peer)
        } else {
            self.verify_hmac(raw_body, signature)
        }
    }

    /// Boolean form of [`Authenticator::verify`]
    pub fn is_authorized(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        peer: Option<&PeerIdentity>,
    ) -> bool {
        self.verify(raw_body, signature, peer).is_ok()
    }

    /// Check a TLS peer against the trust and CN allowlist rules
    pub fn verify_peer(&self, peer: Option<&PeerIdentity>) -> Result<(), AuthError> {
        let peer = peer.ok_or(AuthError::MissingPeer)?;
        if !peer.authorized {
            return Err(AuthError::PeerNotAuthorized);
        }
        if self.cn_allowlist.is_empty() {
            return Ok(());
        }

        let cn = peer
            .common_name
            .as_deref()
            .ok_or(AuthError::MissingPeerCommonName)?;
        if self.cn_allowlist.contains(cn) {
            Ok(())
        } else {
            Err(AuthError::CommonNameNotAllowed(cn.to_string()))
        }
    }

    /// Check the body signature against the shared secret
    pub fn verify_hmac(&self, raw_body: &[u8], signature: Option<&str>) -> Result<(), AuthError> {
        let secret = self
            .shared_secret
            .as_deref()
            .ok_or(AuthError::SecretNotConfigured)?;
        let signature = signature
            .filter(|s| !s.trim().is_empty())
            .ok_or(AuthError::MissingSignature)?;

        if verify_signature(secret, raw_body, signature) {
            Ok(())
        } else {
            Err(AuthError::SignatureMismatch)
        }
    }

    /// Whether the caller may trigger automatic text-command execution
    ///
    /// A verified TLS peer is preferred and decides on its own. Without one,
    /// a valid signature is accepted only when `auto_allow_hmac` is enabled.
    pub fn verify_auto_exec(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        peer: Option<&PeerIdentity>,
    ) -> Result<(), AuthError> {
        match peer {
            Some(p) if p.authorized => self.verify_peer(Some(p)),
            _ if self.auto_allow_hmac => self.verify_hmac(raw_body, signature),
            Some(_) => Err(AuthError::PeerNotAuthorized),
            None => Err(AuthError::MissingPeer),
        }
    }
}
