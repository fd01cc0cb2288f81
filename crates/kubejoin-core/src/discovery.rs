//! Discovery configuration.
//!
//! A node is configured with exactly one discovery mechanism. The variants
//! share one tagged representation so that callers never need to know how
//! many mechanisms exist.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a joining node learns its control-plane endpoints and trust anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DiscoveryConfig {
    /// Endpoints and CA certificate distributed manually by the operator.
    OutOfBand(OutOfBandDiscovery),
    /// Token and peer list used to negotiate a trust anchor. Reserved.
    Gossip(GossipDiscovery),
}

impl DiscoveryConfig {
    /// Short name of the active variant, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::OutOfBand(_) => "OutOfBand",
            Self::Gossip(_) => "Gossip",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutOfBandDiscovery {
    /// Comma separated API server URLs, in preference order.
    pub api_server_urls: String,

    /// Path to the PEM-encoded cluster CA certificate.
    pub ca_cert_path: PathBuf,

    /// DNS name for the API server, encoded into its certificate's SANs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_dns_name: Option<String>,

    /// Address the API server listens on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_ip: Option<IpAddr>,
}

impl OutOfBandDiscovery {
    pub fn new(api_server_urls: impl Into<String>, ca_cert_path: impl Into<PathBuf>) -> Self {
        Self {
            api_server_urls: api_server_urls.into(),
            ca_cert_path: ca_cert_path.into(),
            ..Default::default()
        }
    }

    /// Split the configured URL list on `,`, keeping order.
    ///
    /// Surrounding whitespace is trimmed and empty segments are dropped.
    pub fn endpoints(&self) -> Vec<String> {
        self.api_server_urls
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDiscovery {
    pub token: String,
    pub peers: Vec<String>,
}
