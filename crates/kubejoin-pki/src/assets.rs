//! On-disk layout of PKI assets.
//!
//! For an asset named `name` the directory holds `name-key.pem`,
//! `name-pub.pem` and `name.pem`. Every file is written to a temporary
//! sibling and renamed into place, so a file is either absent or complete.

use std::path::{Path, PathBuf};

use crate::ca::{CertificateAuthority, IssuedCertificate, ServiceAccountKey};
use crate::error::PkiError;

pub const CA_NAME: &str = "ca";
pub const API_SERVER_NAME: &str = "apiserver";
pub const SERVICE_ACCOUNT_NAME: &str = "sa";
pub const ADMIN_NAME: &str = "admin";

#[derive(Debug, Clone)]
pub struct PkiLayout {
    dir: PathBuf,
}

impl PkiLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}-key.pem", name))
    }

    pub fn public_key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}-pub.pem", name))
    }

    pub fn cert_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.pem", name))
    }

    pub fn create_dir(&self) -> Result<(), PkiError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PkiError::Write {
            path: self.dir.clone(),
            source: e,
        })
    }

    /// The root counts as present only when both its key and certificate are.
    pub fn has_root(&self) -> bool {
        self.key_path(CA_NAME).is_file() && self.cert_path(CA_NAME).is_file()
    }

    /// Write the root. The key goes first, so a present certificate implies
    /// a present key.
    pub fn write_root(&self, ca: &CertificateAuthority) -> Result<(), PkiError> {
        write_file(&self.key_path(CA_NAME), ca.key_pem().as_bytes(), true)?;
        write_file(&self.public_key_path(CA_NAME), ca.public_key_pem().as_bytes(), false)?;
        write_file(&self.cert_path(CA_NAME), ca.cert_pem().as_bytes(), false)
    }

    pub fn load_root(&self) -> Result<CertificateAuthority, PkiError> {
        CertificateAuthority::from_files(self.cert_path(CA_NAME), self.key_path(CA_NAME))
    }

    pub fn write_leaf(&self, name: &str, issued: &IssuedCertificate) -> Result<(), PkiError> {
        write_file(&self.key_path(name), issued.key_pem.as_bytes(), true)?;
        write_file(&self.public_key_path(name), issued.public_key_pem.as_bytes(), false)?;
        write_file(&self.cert_path(name), issued.cert_pem.as_bytes(), false)
    }

    /// Write a key pair with no certificate.
    pub fn write_key_only(&self, name: &str, key: &ServiceAccountKey) -> Result<(), PkiError> {
        write_file(&self.key_path(name), key.key_pem.as_bytes(), true)?;
        write_file(&self.public_key_path(name), key.public_key_pem.as_bytes(), false)
    }
}

/// Write `contents` to `path` via a temporary file and rename. Private
/// material gets owner-only permissions.
pub(crate) fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<(), PkiError> {
    let err = |e: std::io::Error| PkiError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, contents).map_err(err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if private { 0o600 } else { 0o644 };
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode)).map_err(err)?;
    }
    #[cfg(not(unix))]
    let _ = private;

    std::fs::rename(&tmp, path).map_err(err)
}
