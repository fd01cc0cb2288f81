//! PKI errors.

use std::path::PathBuf;

use kubejoin_core::ErrorKind;
use thiserror::Error;

/// Errors that can occur during CA operations and asset generation.
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(String),

    #[error("failed to sign certificate: {0}")]
    Sign(String),

    #[error("invalid subject alternative name '{0}'")]
    InvalidAltName(String),

    #[error("failed to parse CA certificate: {0}")]
    ParseCert(String),

    #[error("failed to parse private key: {0}")]
    ParseKey(String),

    #[error("failed to parse CSR: {0}")]
    ParseCsr(String),

    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to render kubeconfig: {0}")]
    Kubeconfig(#[from] serde_yaml::Error),

    #[error("issuance task failed: {0}")]
    Task(String),
}

impl PkiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::KeyGeneration(_) | Self::Sign(_) | Self::Task(_) => ErrorKind::Crypto,
            Self::Read { .. } | Self::Write { .. } => ErrorKind::Io,
            Self::ParseCsr(_) | Self::InvalidCsr(_) => ErrorKind::Protocol,
            Self::InvalidAltName(_)
            | Self::ParseCert(_)
            | Self::ParseKey(_)
            | Self::Kubeconfig(_) => ErrorKind::Configuration,
        }
    }
}
