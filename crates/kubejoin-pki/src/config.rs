//! Control-plane PKI configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Everything PKI generation needs to know, passed in explicitly so that
/// independent runs (for example in tests) never share paths.
#[derive(Debug, Clone)]
pub struct PkiConfig {
    /// Directory receiving kubeconfig files; assets go to `<prefix>/pki`.
    pub prefix_dir: PathBuf,

    /// Cluster name used in client configurations.
    pub cluster_name: String,

    /// Common name of the root CA.
    pub ca_common_name: String,

    /// Name of the control-plane host, used for its own kubelet identity.
    pub node_name: String,

    /// Root CA validity in days.
    pub ca_validity_days: u32,

    /// Leaf certificate validity in days.
    pub leaf_validity_days: u32,

    /// First address of the service range, where the API service lives.
    pub service_ip: IpAddr,

    /// In-cluster name of the API service.
    pub service_name: String,

    /// Namespace of the API service.
    pub service_namespace: String,

    /// Cluster DNS domain.
    pub dns_domain: String,

    /// Operator-supplied address the API server listens on.
    pub listen_ip: Option<IpAddr>,

    /// Operator-supplied DNS name for the API server.
    pub api_server_dns_name: Option<String>,

    /// API server secure port.
    pub secure_port: u16,
}

impl PkiConfig {
    pub fn pki_dir(&self) -> PathBuf {
        self.prefix_dir.join("pki")
    }

    /// The four canonical in-cluster names of the API service.
    pub fn service_dns_names(&self) -> [String; 4] {
        let svc = &self.service_name;
        let ns = &self.service_namespace;
        [
            svc.clone(),
            format!("{}.{}", svc, ns),
            format!("{}.{}.svc", svc, ns),
            format!("{}.{}.svc.{}", svc, ns, self.dns_domain),
        ]
    }

    /// URL written into generated client configurations.
    pub fn api_server_url(&self) -> String {
        let ip = self
            .listen_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        format!("https://{}", SocketAddr::new(ip, self.secure_port))
    }
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            prefix_dir: PathBuf::from("/etc/kubernetes"),
            cluster_name: "kubernetes".to_string(),
            ca_common_name: "kubernetes".to_string(),
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            ca_validity_days: 3650,
            leaf_validity_days: 365,
            service_ip: IpAddr::V4(Ipv4Addr::new(10, 3, 0, 1)),
            service_name: "kubernetes".to_string(),
            service_namespace: "default".to_string(),
            dns_domain: "cluster.local".to_string(),
            listen_ip: None,
            api_server_dns_name: None,
            secure_port: 443,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_dns_names() {
        let config = PkiConfig::default();
        assert_eq!(
            config.service_dns_names(),
            [
                "kubernetes",
                "kubernetes.default",
                "kubernetes.default.svc",
                "kubernetes.default.svc.cluster.local",
            ]
        );
    }

    #[test]
    fn test_api_server_url() {
        let mut config = PkiConfig::default();
        assert_eq!(config.api_server_url(), "https://127.0.0.1:443");

        config.listen_ip = Some("fd00::1".parse().unwrap());
        config.secure_port = 6443;
        assert_eq!(config.api_server_url(), "https://[fd00::1]:6443");
    }
}
