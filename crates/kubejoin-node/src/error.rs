//! Error types for the node side of a join.

use std::path::PathBuf;
use std::time::Duration;

use kubejoin_core::{ErrorKind, InvalidTransition, TokenError};
use thiserror::Error;

use crate::retry::Retryable;

/// Errors from resolving endpoints and the trust anchor.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("{mechanism} discovery is not implemented")]
    Unimplemented { mechanism: &'static str },

    #[error("failed to read CA certificate {path}: {source}")]
    ReadCaCert {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid CA certificate: {0}")]
    InvalidCaCert(String),

    #[error("no API server endpoints configured")]
    NoEndpoints,
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ReadCaCert { .. } => ErrorKind::Io,
            Self::Unimplemented { .. } | Self::InvalidCaCert(_) | Self::NoEndpoints => {
                ErrorKind::Configuration
            }
        }
    }
}

/// Errors talking to the approval authority.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("signing request not found: {0}")]
    NotFound(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("signing request {0} was deleted")]
    Deleted(String),

    #[error("approval authority unavailable: {0}")]
    Unavailable(String),

    #[error("invalid trust anchor: {0}")]
    TrustAnchor(String),
}

impl ApprovalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TrustAnchor(_) => ErrorKind::Configuration,
            _ => ErrorKind::Protocol,
        }
    }

    /// Connectivity problems and server-side failures may clear up.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_builder() && !e.is_decode(),
            Self::Status { code, .. } => *code >= 500 || *code == 429,
            Self::Unavailable(_) => true,
            Self::NotFound(_) | Self::Decode(_) | Self::Deleted(_) | Self::TrustAnchor(_) => false,
        }
    }
}

/// Errors from the TLS bootstrap exchange.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no endpoint to bootstrap against")]
    NoEndpoints,

    #[error("failed to generate private key: {0}")]
    KeyGeneration(String),

    #[error("failed to encode certificate request: {0}")]
    CsrEncoding(String),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("certificate request denied: {reason}: {message}")]
    Denied { reason: String, message: String },

    #[error("watch stream closed before a decision")]
    WatchClosed,

    #[error("no decision within {0:?}")]
    Timeout(Duration),

    #[error("bootstrap cancelled")]
    Cancelled,

    #[error("issued certificate rejected: {0}")]
    InvalidCertificate(String),
}

impl BootstrapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoEndpoints => ErrorKind::Configuration,
            Self::KeyGeneration(_) | Self::CsrEncoding(_) => ErrorKind::Crypto,
            Self::Approval(e) => e.kind(),
            Self::Denied { .. } | Self::WatchClosed | Self::InvalidCertificate(_) => {
                ErrorKind::Protocol
            }
            Self::Timeout(_) | Self::Cancelled => ErrorKind::Timeout,
        }
    }
}

impl Retryable for BootstrapError {
    /// A denial reflects an administrator decision and is never transient.
    fn is_transient(&self) -> bool {
        match self {
            Self::Approval(e) => e.is_transient(),
            Self::WatchClosed => true,
            _ => false,
        }
    }
}

/// Errors from driving the join state machine.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("no bootstrap token supplied")]
    MissingToken,

    #[error("no discovery configuration supplied")]
    MissingDiscovery,

    #[error("invalid bootstrap token: {0}")]
    Token(#[from] TokenError),

    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("failed to write {path}: {source}")]
    WriteKubeconfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to render kubeconfig: {0}")]
    Render(String),

    #[error("join finished without an identity")]
    NoIdentity,
}

impl JoinError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingToken | Self::MissingDiscovery | Self::Transition(_) => {
                ErrorKind::Configuration
            }
            Self::Token(e) => e.kind(),
            Self::Discovery(e) => e.kind(),
            Self::Bootstrap(e) => e.kind(),
            Self::WriteKubeconfig { .. } => ErrorKind::Io,
            Self::Render(_) => ErrorKind::Configuration,
            Self::NoIdentity => ErrorKind::Protocol,
        }
    }
}
