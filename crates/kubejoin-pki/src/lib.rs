//! kubejoin PKI
//!
//! Certificate authority generation and leaf issuance for control-plane
//! identities, plus the on-disk layout of the resulting assets.
//!
//! The root CA is always written before any leaf is issued. Leaves are
//! independent of each other and are issued concurrently from a shared,
//! read-only root.

pub mod assets;
pub mod ca;
pub mod config;
pub mod error;
pub mod generate;

pub use assets::PkiLayout;
pub use ca::{
    generate_key, issue_service_account_key, AltNames, CertUsage, CertificateAuthority,
    IssuedCertificate, LeafRequest, ServiceAccountKey, SignedCertificate,
};
pub use config::PkiConfig;
pub use error::PkiError;
pub use generate::{generate_pki, load_or_create_root, PkiAssets};
