//! Atomic trust-bundle replacement
//!
//! All three files are staged as `<target>.tmp` siblings first, then renamed
//! over their targets in the order key, cert, CA. If any step fails the
//! targets are put back to their prior contents and the temp files removed.
//! A target that exists but cannot be read aborts the write before staging.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use super::vault::VaultSecret;
use super::RotationError;

const KEY_MODE: u32 = 0o600;
const CERT_MODE: u32 = 0o644;

static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Target locations of the server key, server certificate and CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub ca: PathBuf,
}

impl BundlePaths {
    pub fn new(key: impl Into<PathBuf>, cert: impl Into<PathBuf>, ca: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            cert: cert.into(),
            ca: ca.into(),
        }
    }

    /// Replace all three files or none of them
    ///
    /// Calls in one process are serialized, since they share the temp paths.
    pub fn write_bundle_atomically(&self, secret: &VaultSecret) -> Result<(), RotationError> {
        let _guard = INSTALL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let staged = [
            (self.key.as_path(), secret.server_key.as_bytes(), KEY_MODE),
            (self.cert.as_path(), secret.server_cert.as_bytes(), CERT_MODE),
            (self.ca.as_path(), secret.ca_cert.as_bytes(), CERT_MODE),
        ];

        // Prior contents, captured before anything is touched
        let prior = staged
            .iter()
            .map(|(target, _, _)| read_prior(target))
            .collect::<Result<Vec<_>, _>>()?;

        let mut temps: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for (target, contents, mode) in &staged {
            let tmp = temp_path(target);
            if let Err(e) = write_with_mode(&tmp, contents, *mode) {
                remove_all(&temps);
                let _ = fs::remove_file(&tmp);
                return Err(RotationError::Write {
                    path: tmp,
                    message: e.to_string(),
                });
            }
            temps.push(tmp);
        }

        commit(&staged, &temps, &prior)
    }
}

/// Rename each temp over its target, rolling back earlier renames on failure
fn commit(
    staged: &[(&Path, &[u8], u32)],
    temps: &[PathBuf],
    prior: &[Option<Vec<u8>>],
) -> Result<(), RotationError> {
    for (i, ((target, _, mode), tmp)) in staged.iter().zip(temps).enumerate() {
        if let Err(e) = fs::rename(tmp, target) {
            warn!("Rename of {} failed, restoring prior bundle", target.display());
            for ((restored, _, mode), previous) in staged[..i].iter().zip(prior) {
                restore(restored, previous.as_deref(), *mode);
            }
            remove_all(&temps[i..]);
            return Err(RotationError::Rename {
                path: target.to_path_buf(),
                message: e.to_string(),
            });
        }
        debug!("Replaced {} (mode {:o})", target.display(), mode);
    }
    Ok(())
}

/// Current contents of `target`, or `None` when it does not exist yet
fn read_prior(target: &Path) -> Result<Option<Vec<u8>>, RotationError> {
    match fs::read(target) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RotationError::Read {
            path: target.to_path_buf(),
            message: e.to_string(),
        }),
    }
}

/// `<path>.tmp`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;

    // A pre-existing temp file keeps its old mode, and umask narrows new ones
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

fn restore(target: &Path, previous: Option<&[u8]>, mode: u32) {
    let result = match previous {
        Some(contents) => write_with_mode(target, contents, mode),
        None => fs::remove_file(target),
    };
    if let Err(e) = result {
        warn!("Failed to restore {}: {}", target.display(), e);
    }
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
}
