//! Node agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Default bound on waiting for a signing decision.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(3600);

/// Join configuration.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Cluster name used in the client configuration.
    pub cluster_name: String,

    /// Name this node requests its identity for.
    pub node_name: String,

    /// How long to wait for the signing request to be decided.
    pub watch_timeout: Duration,

    /// Retry policy for transient bootstrap failures.
    pub retry: RetryConfig,

    /// Move to the next discovered endpoint after a transient failure.
    pub endpoint_failover: bool,

    /// Where to write the issued identity, if anywhere.
    pub kubeconfig_path: Option<PathBuf>,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            cluster_name: "kubernetes".to_string(),
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            retry: RetryConfig::default(),
            endpoint_failover: false,
            kubeconfig_path: None,
        }
    }
}
