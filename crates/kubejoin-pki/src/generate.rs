//! Init-time PKI generation.
//!
//! Order matters: the root is fully on disk before any leaf is issued, and
//! any failure aborts the run. A crash after the root write is recovered by
//! re-running, which reuses the existing root.

use std::path::PathBuf;
use std::sync::Arc;

use kubejoin_core::csr::NODE_GROUP;
use kubejoin_core::{node_identity, BareConfig, ClientIdentity};
use tracing::info;

use crate::assets::{self, PkiLayout, ADMIN_NAME, API_SERVER_NAME, SERVICE_ACCOUNT_NAME};
use crate::ca::{
    issue_service_account_key, CertificateAuthority, IssuedCertificate, LeafRequest,
    ServiceAccountKey,
};
use crate::config::PkiConfig;
use crate::error::PkiError;

pub const ADMIN_COMMON_NAME: &str = "kubernetes-admin";
pub const ADMIN_GROUP: &str = "system:masters";

pub const ADMIN_KUBECONFIG: &str = "admin.conf";
pub const KUBELET_KUBECONFIG: &str = "kubelet.conf";

/// Everything produced by [`generate_pki`].
#[derive(Debug)]
pub struct PkiAssets {
    pub ca_cert_pem: String,
    pub reused_root: bool,
    pub api_server: IssuedCertificate,
    pub service_account: ServiceAccountKey,
    pub admin: IssuedCertificate,
    pub kubelet: IssuedCertificate,
    pub admin_kubeconfig: PathBuf,
    pub kubelet_kubeconfig: PathBuf,
}

/// Load the root if both its files exist, otherwise generate and persist one.
///
/// Returns the CA and whether it was reused.
pub fn load_or_create_root(
    config: &PkiConfig,
    layout: &PkiLayout,
) -> Result<(CertificateAuthority, bool), PkiError> {
    if layout.has_root() {
        let ca = layout.load_root()?;
        info!(dir = %layout.dir().display(), "Reusing existing root CA");
        return Ok((ca, true));
    }

    let ca = CertificateAuthority::generate_root(&config.ca_common_name, config.ca_validity_days)?;
    layout.write_root(&ca)?;
    info!(dir = %layout.dir().display(), "Wrote root CA");
    Ok((ca, false))
}

async fn issue_blocking(
    ca: Arc<CertificateAuthority>,
    request: LeafRequest,
) -> Result<IssuedCertificate, PkiError> {
    tokio::task::spawn_blocking(move || ca.issue(&request))
        .await
        .map_err(|e| PkiError::Task(e.to_string()))?
}

/// Generate the control-plane PKI and client configurations.
pub async fn generate_pki(config: &PkiConfig) -> Result<PkiAssets, PkiError> {
    let layout = PkiLayout::new(config.pki_dir());
    layout.create_dir()?;

    let (ca, reused_root) = load_or_create_root(config, &layout)?;
    let ca = Arc::new(ca);

    let validity = config.leaf_validity_days;
    let (api_server, admin, kubelet, service_account) = tokio::try_join!(
        issue_blocking(ca.clone(), LeafRequest::api_server(config)),
        issue_blocking(
            ca.clone(),
            LeafRequest::client(ADMIN_COMMON_NAME, Some(ADMIN_GROUP), validity),
        ),
        issue_blocking(
            ca.clone(),
            LeafRequest::client(node_identity(&config.node_name), Some(NODE_GROUP), validity),
        ),
        async {
            tokio::task::spawn_blocking(issue_service_account_key)
                .await
                .map_err(|e| PkiError::Task(e.to_string()))?
        },
    )?;

    layout.write_leaf(API_SERVER_NAME, &api_server)?;
    layout.write_key_only(SERVICE_ACCOUNT_NAME, &service_account)?;
    layout.write_leaf(ADMIN_NAME, &admin)?;

    let bare = BareConfig::new(
        config.cluster_name.clone(),
        config.api_server_url(),
        ca.cert_pem().as_bytes(),
    );
    let admin_kubeconfig = config.prefix_dir.join(ADMIN_KUBECONFIG);
    write_kubeconfig(&admin_kubeconfig, bare.clone(), &admin)?;
    let kubelet_kubeconfig = config.prefix_dir.join(KUBELET_KUBECONFIG);
    write_kubeconfig(&kubelet_kubeconfig, bare, &kubelet)?;

    info!(
        pki_dir = %layout.dir().display(),
        reused_root,
        "Generated control-plane PKI"
    );

    Ok(PkiAssets {
        ca_cert_pem: ca.cert_pem().to_string(),
        reused_root,
        api_server,
        service_account,
        admin,
        kubelet,
        admin_kubeconfig,
        kubelet_kubeconfig,
    })
}

fn write_kubeconfig(
    path: &std::path::Path,
    bare: BareConfig,
    issued: &IssuedCertificate,
) -> Result<(), PkiError> {
    let identity = ClientIdentity::new(
        bare,
        issued.common_name.clone(),
        issued.key_pem.as_bytes(),
        issued.cert_pem.as_bytes(),
    );
    let yaml = identity.to_yaml()?;
    assets::write_file(path, yaml.as_bytes(), true)
}
