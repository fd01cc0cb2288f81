//! Certificate Authority for control-plane identities and node CSRs.
//!
//! Uses rcgen to generate keys and certificates, and x509-parser to inspect
//! incoming CSRs.

use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Datelike, Utc};
use kubejoin_core::csr::{NODE_GROUP, NODE_IDENTITY_PREFIX};
use rcgen::{
    Certificate, CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::debug;
use x509_parser::prelude::*;

use crate::config::PkiConfig;
use crate::error::PkiError;

/// Generate a private key.
///
/// ECDSA P-256 gives roughly 128-bit security, above RSA-2048.
pub fn generate_key() -> Result<KeyPair, PkiError> {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| PkiError::KeyGeneration(e.to_string()))
}

/// Key pair used to sign and verify service account tokens. Has no certificate.
#[derive(Clone)]
pub struct ServiceAccountKey {
    pub key_pem: String,
    pub public_key_pem: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("public_key_pem", &self.public_key_pem)
            .finish_non_exhaustive()
    }
}

pub fn issue_service_account_key() -> Result<ServiceAccountKey, PkiError> {
    let key = generate_key()?;
    Ok(ServiceAccountKey {
        key_pem: key.serialize_pem(),
        public_key_pem: key.public_key_pem(),
    })
}

/// Subject alternative names of a leaf certificate, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltNames {
    pub dns_names: Vec<String>,
    pub ips: Vec<IpAddr>,
}

impl AltNames {
    pub fn add_dns(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.dns_names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
            self.dns_names.push(name);
        }
    }

    pub fn add_ip(&mut self, ip: IpAddr) {
        if !self.ips.contains(&ip) {
            self.ips.push(ip);
        }
    }

    /// Names for the API server: operator extras first, then the fixed
    /// service address and the canonical in-cluster DNS names.
    pub fn for_api_server(config: &PkiConfig) -> Self {
        let mut names = Self::default();
        if let Some(ip) = config.listen_ip {
            names.add_ip(ip);
        }
        if let Some(dns) = &config.api_server_dns_name {
            names.add_dns(dns.clone());
        }
        names.add_ip(config.service_ip);
        for dns in config.service_dns_names() {
            names.add_dns(dns);
        }
        names
    }

    fn to_san_types(&self) -> Result<Vec<SanType>, PkiError> {
        let mut sans = Vec::with_capacity(self.dns_names.len() + self.ips.len());
        for dns in &self.dns_names {
            let name = dns
                .clone()
                .try_into()
                .map_err(|_| PkiError::InvalidAltName(dns.clone()))?;
            sans.push(SanType::DnsName(name));
        }
        for ip in &self.ips {
            sans.push(SanType::IpAddress(*ip));
        }
        Ok(sans)
    }
}

/// What a leaf certificate may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
    Server,
    Client,
    ServerAndClient,
}

impl CertUsage {
    fn extended_key_usages(&self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            Self::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            Self::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
            Self::ServerAndClient => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        }
    }
}

/// Parameters of a leaf certificate to issue.
#[derive(Debug, Clone)]
pub struct LeafRequest {
    pub common_name: String,
    pub organization: Option<String>,
    pub alt_names: AltNames,
    pub usage: CertUsage,
    pub validity_days: u32,
}

impl LeafRequest {
    /// The API server's serving identity.
    pub fn api_server(config: &PkiConfig) -> Self {
        Self {
            common_name: "kube-apiserver".to_string(),
            organization: None,
            alt_names: AltNames::for_api_server(config),
            usage: CertUsage::ServerAndClient,
            validity_days: config.leaf_validity_days,
        }
    }

    /// A client identity without alternative names.
    pub fn client(
        common_name: impl Into<String>,
        organization: Option<&str>,
        validity_days: u32,
    ) -> Self {
        Self {
            common_name: common_name.into(),
            organization: organization.map(str::to_string),
            alt_names: AltNames::default(),
            usage: CertUsage::Client,
            validity_days,
        }
    }
}

/// A leaf key pair and its certificate, PEM encoded.
#[derive(Clone)]
pub struct IssuedCertificate {
    pub common_name: String,
    pub key_pem: String,
    pub public_key_pem: String,
    pub cert_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("common_name", &self.common_name)
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// A certificate issued for a node's CSR.
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    /// The signed certificate in PEM format.
    pub cert_pem: String,

    /// When the certificate expires.
    pub expires_at: DateTime<Utc>,

    /// The node name extracted from the CN.
    pub node_name: String,
}

/// Root certificate authority. Read-only once built, so it can be shared
/// across concurrent issuances.
pub struct CertificateAuthority {
    /// Certificate as distributed to nodes (PEM).
    cert_pem: String,

    /// Issuer view of the certificate, used for signing.
    cert: Certificate,

    key: KeyPair,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a self-signed root.
    pub fn generate_root(common_name: &str, validity_days: u32) -> Result<Self, PkiError> {
        let key = generate_key()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, validity_days);

        let cert = params
            .self_signed(&key)
            .map_err(|e| PkiError::Sign(e.to_string()))?;

        debug!(common_name = %common_name, validity_days, "Generated root CA");

        Ok(Self {
            cert_pem: cert.pem(),
            cert,
            key,
        })
    }

    /// Rebuild a CA from its PEM certificate and key.
    pub fn load(cert_pem: &str, key_pem: &str) -> Result<Self, PkiError> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| PkiError::ParseKey(e.to_string()))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| PkiError::ParseCert(e.to_string()))?;
        if !matches!(params.is_ca, IsCa::Ca(_)) {
            return Err(PkiError::ParseCert("certificate is not a CA".to_string()));
        }

        // Re-signing only yields an issuer handle; the distributed PEM stays as loaded.
        let cert = params
            .self_signed(&key)
            .map_err(|e| PkiError::ParseCert(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert,
            key,
        })
    }

    /// Load CA from certificate and key files.
    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, PkiError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| PkiError::Read {
            path: cert_path.to_path_buf(),
            source: e,
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| PkiError::Read {
            path: key_path.to_path_buf(),
            source: e,
        })?;
        Self::load(&cert_pem, &key_pem)
    }

    /// Get the CA certificate in PEM format.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    pub fn public_key_pem(&self) -> String {
        self.key.public_key_pem()
    }

    /// Issue a leaf certificate with a freshly generated key.
    pub fn issue(&self, request: &LeafRequest) -> Result<IssuedCertificate, PkiError> {
        let key = generate_key()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, request.common_name.clone());
        if let Some(org) = &request.organization {
            dn.push(DnType::OrganizationName, org.clone());
        }
        params.distinguished_name = dn;
        params.subject_alt_names = request.alt_names.to_san_types()?;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = request.usage.extended_key_usages();
        params.use_authority_key_identifier_extension = true;
        set_validity(&mut params, request.validity_days);

        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(|e| PkiError::Sign(e.to_string()))?;

        debug!(common_name = %request.common_name, "Issued leaf certificate");

        Ok(IssuedCertificate {
            common_name: request.common_name.clone(),
            key_pem: key.serialize_pem(),
            public_key_pem: key.public_key_pem(),
            cert_pem: cert.pem(),
        })
    }

    /// Sign a node's Certificate Signing Request (CSR).
    ///
    /// The CSR must carry a valid self-signature and a `system:node:<name>`
    /// common name. The issued client certificate binds the CSR's own public
    /// key.
    pub fn sign_csr(&self, csr_pem: &str, validity_days: u32) -> Result<SignedCertificate, PkiError> {
        let pem = ::pem::parse(csr_pem).map_err(|e| PkiError::ParseCsr(e.to_string()))?;

        let csr = X509CertificationRequest::from_der(pem.contents())
            .map_err(|e| PkiError::ParseCsr(e.to_string()))?
            .1;
        csr.verify_signature()
            .map_err(|e| PkiError::InvalidCsr(format!("bad signature: {}", e)))?;

        let subject_cn = extract_cn_from_x509_csr(&csr)?;

        let node_name = subject_cn
            .strip_prefix(NODE_IDENTITY_PREFIX)
            .ok_or_else(|| {
                PkiError::InvalidCsr(format!(
                    "CN must start with '{}', got '{}'",
                    NODE_IDENTITY_PREFIX, subject_cn
                ))
            })?
            .to_string();
        if node_name.is_empty() {
            return Err(PkiError::InvalidCsr("node name in CN cannot be empty".to_string()));
        }

        let mut request = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::ParseCsr(e.to_string()))?;
        // Only the public key is taken from the request. Requested SANs and
        // extensions are dropped.
        request.params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject_cn.clone());
        dn.push(DnType::OrganizationName, NODE_GROUP);
        request.params.distinguished_name = dn;
        request.params.is_ca = IsCa::ExplicitNoCa;
        request.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        request.params.extended_key_usages = CertUsage::Client.extended_key_usages();
        request.params.use_authority_key_identifier_extension = true;
        let expires_at = set_validity(&mut request.params, validity_days);

        let cert = request
            .signed_by(&self.cert, &self.key)
            .map_err(|e| PkiError::Sign(e.to_string()))?;

        Ok(SignedCertificate {
            cert_pem: cert.pem(),
            expires_at,
            node_name,
        })
    }
}

/// Set the validity window starting today; returns the expiry.
fn set_validity(params: &mut CertificateParams, validity_days: u32) -> DateTime<Utc> {
    let not_before = Utc::now();
    let not_after = not_before + chrono::Duration::days(i64::from(validity_days));

    params.not_before = rcgen::date_time_ymd(
        not_before.year(),
        not_before.month() as u8,
        not_before.day() as u8,
    );
    params.not_after = rcgen::date_time_ymd(
        not_after.year(),
        not_after.month() as u8,
        not_after.day() as u8,
    );

    not_after
}

/// Extract Common Name from X.509 CSR.
fn extract_cn_from_x509_csr(csr: &X509CertificationRequest<'_>) -> Result<String, PkiError> {
    let attr = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .ok_or_else(|| PkiError::InvalidCsr("CSR does not contain a Common Name (CN)".to_string()))?;

    attr.as_str()
        .map(str::to_string)
        .map_err(|e| PkiError::InvalidCsr(format!("Failed to parse CN: {:?}", e)))
}
