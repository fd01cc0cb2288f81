//! Discovery providers: resolve control-plane endpoints and the trust anchor.

use kubejoin_core::{DiscoveryConfig, GossipDiscovery, OutOfBandDiscovery};
use tracing::{debug, info};
use x509_parser::prelude::*;

use crate::error::DiscoveryError;

/// What a successful discovery yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Endpoints in preference order; never empty.
    pub server_urls: Vec<String>,

    /// PEM-encoded root CA certificate.
    pub trust_anchor_pem: Vec<u8>,
}

/// A way of learning where the control plane is and whom to trust.
pub trait DiscoveryProvider {
    /// Prepare any background state.
    fn start(&self) -> Result<(), DiscoveryError>;

    /// Resolve endpoints and trust anchor. Has no side effects on failure.
    fn discover(&self) -> Result<Discovered, DiscoveryError>;
}

impl DiscoveryProvider for OutOfBandDiscovery {
    /// Trust material was placed by the operator ahead of time.
    fn start(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    fn discover(&self) -> Result<Discovered, DiscoveryError> {
        let trust_anchor_pem =
            std::fs::read(&self.ca_cert_path).map_err(|e| DiscoveryError::ReadCaCert {
                path: self.ca_cert_path.clone(),
                source: e,
            })?;

        let server_urls = self.endpoints();
        if server_urls.is_empty() {
            return Err(DiscoveryError::NoEndpoints);
        }

        check_trust_anchor(&trust_anchor_pem)?;

        debug!(
            endpoints = server_urls.len(),
            ca_cert = %self.ca_cert_path.display(),
            "Out-of-band discovery complete"
        );

        Ok(Discovered {
            server_urls,
            trust_anchor_pem,
        })
    }
}

impl DiscoveryProvider for GossipDiscovery {
    fn start(&self) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::Unimplemented {
            mechanism: "Gossip",
        })
    }

    fn discover(&self) -> Result<Discovered, DiscoveryError> {
        Err(DiscoveryError::Unimplemented {
            mechanism: "Gossip",
        })
    }
}

impl DiscoveryProvider for DiscoveryConfig {
    fn start(&self) -> Result<(), DiscoveryError> {
        info!(mechanism = self.kind_name(), "Starting discovery");
        match self {
            Self::OutOfBand(d) => d.start(),
            Self::Gossip(d) => d.start(),
        }
    }

    fn discover(&self) -> Result<Discovered, DiscoveryError> {
        match self {
            Self::OutOfBand(d) => d.discover(),
            Self::Gossip(d) => d.discover(),
        }
    }
}

/// The anchor must be a single parseable X.509 certificate in PEM form.
fn check_trust_anchor(pem_bytes: &[u8]) -> Result<(), DiscoveryError> {
    let block = ::pem::parse(pem_bytes).map_err(|e| DiscoveryError::InvalidCaCert(e.to_string()))?;
    if block.tag() != "CERTIFICATE" {
        return Err(DiscoveryError::InvalidCaCert(format!(
            "expected CERTIFICATE block, got {}",
            block.tag()
        )));
    }
    X509Certificate::from_der(block.contents())
        .map_err(|e| DiscoveryError::InvalidCaCert(e.to_string()))?;
    Ok(())
}
