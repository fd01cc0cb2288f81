//! Client configurations and the kubeconfig file format.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Minimal client configuration: one endpoint and the only CA it trusts.
///
/// Carries no credential. The bootstrap token is layered on top of it for
/// the signing request, and the issued identity replaces it afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BareConfig {
    pub cluster_name: String,
    pub server_url: String,
    pub ca_cert_pem: Vec<u8>,
}

impl BareConfig {
    pub fn new(
        cluster_name: impl Into<String>,
        server_url: impl Into<String>,
        ca_cert_pem: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            server_url: server_url.into(),
            ca_cert_pem: ca_cert_pem.into(),
        }
    }
}

/// A durable client identity: trust anchor, private key and certificate
/// for one user against one cluster. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    cluster_name: String,
    server_url: String,
    ca_cert_pem: Vec<u8>,
    user_name: String,
    client_key_pem: Vec<u8>,
    client_cert_pem: Vec<u8>,
    context_name: String,
}

impl ClientIdentity {
    /// Combine a bare config with a key and certificate for `user_name`.
    pub fn new(
        bare: BareConfig,
        user_name: impl Into<String>,
        client_key_pem: impl Into<Vec<u8>>,
        client_cert_pem: impl Into<Vec<u8>>,
    ) -> Self {
        let user_name = user_name.into();
        let context_name = format!("{}@{}", user_name, bare.cluster_name);
        Self {
            cluster_name: bare.cluster_name,
            server_url: bare.server_url,
            ca_cert_pem: bare.ca_cert_pem,
            user_name,
            client_key_pem: client_key_pem.into(),
            client_cert_pem: client_cert_pem.into(),
            context_name,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn ca_cert_pem(&self) -> &[u8] {
        &self.ca_cert_pem
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn client_key_pem(&self) -> &[u8] {
        &self.client_key_pem
    }

    pub fn client_cert_pem(&self) -> &[u8] {
        &self.client_cert_pem
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    /// Render as a kubeconfig document with inline base64 data.
    pub fn to_kubeconfig(&self) -> Kubeconfig {
        Kubeconfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: self.cluster_name.clone(),
                cluster: Cluster {
                    server: self.server_url.clone(),
                    certificate_authority_data: STANDARD.encode(&self.ca_cert_pem),
                },
            }],
            users: vec![NamedUser {
                name: self.user_name.clone(),
                user: User {
                    client_certificate_data: STANDARD.encode(&self.client_cert_pem),
                    client_key_data: STANDARD.encode(&self.client_key_pem),
                },
            }],
            contexts: vec![NamedContext {
                name: self.context_name.clone(),
                context: Context {
                    cluster: self.cluster_name.clone(),
                    user: self.user_name.clone(),
                },
            }],
            current_context: self.context_name.clone(),
        }
    }

    /// Render as kubeconfig YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.to_kubeconfig())
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cluster_name", &self.cluster_name)
            .field("server_url", &self.server_url)
            .field("user_name", &self.user_name)
            .field("context_name", &self.context_name)
            .field("client_cert_len", &self.client_cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// A kubeconfig file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    pub current_context: String,
}

impl Kubeconfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,
    pub certificate_authority_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    pub client_certificate_data: String,
    pub client_key_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}
