//! mTLS server context
//!
//! Builds a rustls server config that requires a client certificate chaining
//! to the configured CA, and keeps it behind a swappable handle so rotated
//! material can be picked up without a restart. Connections already
//! established keep the context they were accepted with.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::auth::PeerIdentity;
use crate::metrics::TLS_RELOADS_TOTAL;
use crate::rotation::ReloadHook;

/// Problems loading TLS material
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("invalid client CA: {0}")]
    ClientVerifier(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Locations of the server key, server certificate chain and client CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub ca: PathBuf,
}

impl TlsPaths {
    pub fn new(key: impl Into<PathBuf>, cert: impl Into<PathBuf>, ca: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            cert: cert.into(),
            ca: ca.into(),
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Every certificate in a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// First private key in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Server config that requires and verifies client certificates
pub fn load_server_config(paths: &TlsPaths) -> Result<ServerConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let mut roots = RootCertStore::empty();
    for ca in load_certs(&paths.ca)? {
        roots.add(ca)?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| TlsError::ClientVerifier(e.to_string()))?;

    let certs = load_certs(&paths.cert)?;
    let key = load_private_key(&paths.key)?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Identity of the client on an accepted TLS connection
///
/// Chains reaching this point were verified during the handshake.
pub fn peer_identity(conn: &rustls::ServerConnection) -> Option<PeerIdentity> {
    conn.peer_certificates()
        .and_then(|chain| PeerIdentity::from_certificate_chain(chain, true))
}

/// Swappable TLS context
pub struct TlsReloader {
    paths: TlsPaths,
    current: RwLock<Arc<ServerConfig>>,
}

impl std::fmt::Debug for TlsReloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsReloader")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl TlsReloader {
    /// Load the initial context; fails if the material is unusable
    pub fn load(paths: TlsPaths) -> Result<Self, TlsError> {
        let config = load_server_config(&paths)?;
        info!("Loaded TLS material from {}", paths.cert.display());
        Ok(Self {
            paths,
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn paths(&self) -> &TlsPaths {
        &self.paths
    }

    /// Context used for the next accepted connection
    pub fn current(&self) -> Arc<ServerConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.current())
    }

    /// Re-read the files and swap the context
    ///
    /// On error the previous context stays in place.
    pub fn reload_from_disk(&self) -> Result<(), TlsError> {
        let config = Arc::new(load_server_config(&self.paths)?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }
}

impl ReloadHook for TlsReloader {
    fn reload(&self) -> bool {
        match self.reload_from_disk() {
            Ok(()) => {
                info!("TLS context reloaded");
                TLS_RELOADS_TOTAL.with_label_values(&["success"]).inc();
                true
            }
            Err(e) => {
                warn!("TLS reload failed, keeping previous context: {}", e);
                TLS_RELOADS_TOTAL.with_label_values(&["failure"]).inc();
                false
            }
        }
    }
}
