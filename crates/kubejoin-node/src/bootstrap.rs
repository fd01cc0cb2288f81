//! TLS bootstrap: exchange a bootstrap token for a durable client identity.
//!
//! The node generates its key locally, submits a certificate signing
//! request authenticated by the bootstrap token, waits for the approval
//! authority to decide it, and combines the issued certificate with its key
//! and the discovered trust anchor. The key never leaves the node.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kubejoin_core::csr::NODE_GROUP;
use kubejoin_core::{
    node_identity, BareConfig, ClientIdentity, Decision, SigningRequestRecord,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::approval::ApprovalAuthority;
use crate::discovery::Discovered;
use crate::error::BootstrapError;

/// Upper bound on the best-effort delete of an owned signing request.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimal client configuration for the discovered endpoint at `index`.
pub fn build_bare_config(
    cluster_name: &str,
    discovered: &Discovered,
    index: usize,
) -> Result<BareConfig, BootstrapError> {
    let endpoint = discovered
        .server_urls
        .get(index)
        .ok_or(BootstrapError::NoEndpoints)?;
    Ok(BareConfig::new(
        cluster_name,
        endpoint.as_str(),
        discovered.trust_anchor_pem.clone(),
    ))
}

/// Generate the node's private key.
pub fn generate_key() -> Result<KeyPair, BootstrapError> {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| BootstrapError::KeyGeneration(e.to_string()))
}

/// Name of the kubeconfig user for a node's identity.
pub fn kubelet_user(node_name: &str) -> String {
    format!("kubelet-{}", node_name)
}

/// PEM-encoded PKCS#10 request for `system:node:<node_name>`.
pub fn encode_csr(key: &KeyPair, node_name: &str) -> Result<String, BootstrapError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, node_identity(node_name));
    dn.push(DnType::OrganizationName, NODE_GROUP);
    params.distinguished_name = dn;

    params
        .serialize_request(key)
        .and_then(|csr| csr.pem())
        .map_err(|e| BootstrapError::CsrEncoding(e.to_string()))
}

/// Combine the trust anchor, the local key and the issued certificate.
///
/// The certificate must carry the key's public half and verify against the
/// anchor in `bare`.
pub fn build_final_config(
    bare: BareConfig,
    key: &KeyPair,
    node_name: &str,
    certificate_pem: Vec<u8>,
) -> Result<ClientIdentity, BootstrapError> {
    let invalid = |msg: String| BootstrapError::InvalidCertificate(msg);

    let cert_block = ::pem::parse(&certificate_pem).map_err(|e| invalid(e.to_string()))?;
    let (_, cert) =
        X509Certificate::from_der(cert_block.contents()).map_err(|e| invalid(e.to_string()))?;

    if cert.public_key().raw != key.public_key_der().as_slice() {
        return Err(invalid("certificate does not match the local key".to_string()));
    }

    let anchor_block = ::pem::parse(&bare.ca_cert_pem).map_err(|e| invalid(e.to_string()))?;
    let (_, anchor) =
        X509Certificate::from_der(anchor_block.contents()).map_err(|e| invalid(e.to_string()))?;
    cert.verify_signature(Some(anchor.public_key()))
        .map_err(|e| invalid(format!("not signed by the trust anchor: {}", e)))?;

    Ok(ClientIdentity::new(
        bare,
        kubelet_user(node_name),
        key.serialize_pem(),
        certificate_pem,
    ))
}

/// Deletes the owned signing request exactly once.
///
/// [`CleanupGuard::run`] is the normal path. If the guard is dropped while
/// still armed (the owning future was dropped), the delete is spawned onto
/// the current runtime.
struct CleanupGuard {
    authority: Arc<dyn ApprovalAuthority>,
    name: Option<String>,
}

impl CleanupGuard {
    fn new(authority: Arc<dyn ApprovalAuthority>, name: String) -> Self {
        Self {
            authority,
            name: Some(name),
        }
    }

    async fn run(mut self) {
        if let Some(name) = self.name.take() {
            delete_record(self.authority.as_ref(), &name).await;
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        let authority = self.authority.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    delete_record(authority.as_ref(), &name).await;
                });
            }
            Err(_) => warn!(name = %name, "No runtime to delete signing request"),
        }
    }
}

/// Best-effort delete, bounded by [`CLEANUP_TIMEOUT`]; failures are logged only.
async fn delete_record(authority: &dyn ApprovalAuthority, name: &str) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, authority.delete(name)).await {
        Ok(Ok(())) => debug!(name = %name, "Deleted signing request"),
        Ok(Err(e)) => warn!(name = %name, error = %e, "Failed to delete signing request"),
        Err(_) => warn!(
            name = %name,
            timeout_secs = CLEANUP_TIMEOUT.as_secs(),
            "Timed out deleting signing request"
        ),
    }
}

/// What a single status snapshot means for the flow.
fn evaluate(record: &SigningRequestRecord) -> Option<Result<Vec<u8>, BootstrapError>> {
    match record.decision() {
        Decision::Pending => None,
        Decision::Denied { reason, message } => {
            Some(Err(BootstrapError::Denied { reason, message }))
        }
        Decision::Approved {
            certificate,
            condition_present,
        } => {
            if !condition_present {
                debug!(name = %record.name, "Certificate present without Approved condition");
            }
            Some(Ok(certificate))
        }
    }
}

/// Node-side client of the signing-request protocol.
pub struct BootstrapClient {
    authority: Arc<dyn ApprovalAuthority>,
    watch_timeout: Duration,
}

impl BootstrapClient {
    pub fn new(authority: Arc<dyn ApprovalAuthority>, watch_timeout: Duration) -> Self {
        Self {
            authority,
            watch_timeout,
        }
    }

    /// Encode and submit a request for the node identity.
    pub async fn submit_csr(
        &self,
        key: &KeyPair,
        node_name: &str,
    ) -> Result<SigningRequestRecord, BootstrapError> {
        let csr = encode_csr(key, node_name)?;
        let record = self.authority.create(csr.as_bytes()).await?;
        info!(name = %record.name, node = %node_name, "Submitted certificate signing request");
        Ok(record)
    }

    /// Wait for a decision on `name` and return the issued certificate.
    ///
    /// Bounded by the watch timeout; `shutdown` aborts the wait. Dropping the
    /// inner future on either path also drops the watch subscription.
    pub async fn await_decision(
        &self,
        name: &str,
        shutdown: &CancellationToken,
    ) -> Result<Vec<u8>, BootstrapError> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(name = %name, "Bootstrap cancelled");
                Err(BootstrapError::Cancelled)
            }
            result = tokio::time::timeout(self.watch_timeout, self.decide(name)) => {
                result.unwrap_or(Err(BootstrapError::Timeout(self.watch_timeout)))
            }
        }
    }

    async fn decide(&self, name: &str) -> Result<Vec<u8>, BootstrapError> {
        // The decision may have landed before the watch starts.
        match self.authority.get(name).await {
            Ok(record) => {
                if let Some(result) = evaluate(&record) {
                    return result;
                }
            }
            Err(e) => warn!(name = %name, error = %e, "Point-read failed, falling back to watch"),
        }

        let mut updates = self.authority.watch(name).await?;
        while let Some(update) = updates.next().await {
            if let Some(result) = evaluate(&update?) {
                return result;
            }
        }

        Err(BootstrapError::WatchClosed)
    }

    /// Run the whole exchange against the endpoint in `bare`.
    ///
    /// The submitted record is deleted on every exit path once it exists.
    pub async fn request_identity(
        &self,
        bare: BareConfig,
        node_name: &str,
        shutdown: &CancellationToken,
    ) -> Result<ClientIdentity, BootstrapError> {
        let key = generate_key()?;
        let record = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(node = %node_name, "Bootstrap cancelled before the request was created");
                return Err(BootstrapError::Cancelled);
            }
            record = self.submit_csr(&key, node_name) => record?,
        };

        let guard = CleanupGuard::new(self.authority.clone(), record.name.clone());
        let decision = self.await_decision(&record.name, shutdown).await;
        guard.run().await;

        let certificate = decision?;
        let identity = build_final_config(bare, &key, node_name, certificate)?;
        info!(
            node = %node_name,
            context = %identity.context_name(),
            "Client identity issued"
        );
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::memory::{InMemoryApprovalAuthority, Policy};
    use crate::error::ApprovalError;
    use kubejoin_core::{RequestCondition, SigningRequestStatus};
    use kubejoin_pki::CertificateAuthority;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn root() -> Arc<CertificateAuthority> {
        Arc::new(CertificateAuthority::generate_root("kubernetes", 30).unwrap())
    }

    fn bare_for(ca: &CertificateAuthority) -> BareConfig {
        BareConfig::new("kubernetes", "https://10.0.0.1:443", ca.cert_pem().as_bytes())
    }

    fn client(authority: &Arc<InMemoryApprovalAuthority>) -> BootstrapClient {
        BootstrapClient::new(authority.clone(), TIMEOUT)
    }

    #[test]
    fn test_bare_config_picks_endpoint_by_index() {
        let discovered = Discovered {
            server_urls: vec!["https://a:443".to_string(), "https://b:443".to_string()],
            trust_anchor_pem: b"anchor".to_vec(),
        };
        let bare = build_bare_config("kubernetes", &discovered, 0).unwrap();
        assert_eq!(bare.server_url, "https://a:443");
        assert_eq!(bare.ca_cert_pem, b"anchor");
        let bare = build_bare_config("kubernetes", &discovered, 1).unwrap();
        assert_eq!(bare.server_url, "https://b:443");
        assert!(matches!(
            build_bare_config("kubernetes", &discovered, 2),
            Err(BootstrapError::NoEndpoints)
        ));

        let empty = Discovered {
            server_urls: vec![],
            trust_anchor_pem: vec![],
        };
        assert!(matches!(
            build_bare_config("kubernetes", &empty, 0),
            Err(BootstrapError::NoEndpoints)
        ));
    }

    #[test]
    fn test_csr_names_the_node() {
        let key = generate_key().unwrap();
        let pem = encode_csr(&key, "worker-1").unwrap();

        let der = ::pem::parse(&pem).unwrap().into_contents();
        let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();
        csr.verify_signature().unwrap();
        let cn = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(cn, "system:node:worker-1");
    }

    #[tokio::test]
    async fn test_auto_approved_request_resolves_on_point_read() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::AutoApprove(ca.clone())));

        let identity = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(identity.user_name(), "kubelet-worker-1");
        assert_eq!(identity.context_name(), "kubelet-worker-1@kubernetes");
        assert_eq!(identity.ca_cert_pem(), ca.cert_pem().as_bytes());
        assert_eq!(authority.calls.gets(), 1);
        assert_eq!(authority.calls.watches(), 0);
        assert_eq!(authority.calls.deletes(), 1);
        assert_eq!(authority.len().await, 0);
    }

    #[tokio::test]
    async fn test_approval_arrives_through_watch() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Manual));

        let approver = {
            let authority = authority.clone();
            let ca = ca.clone();
            tokio::spawn(async move {
                while authority.calls.watches() == 0 {
                    tokio::task::yield_now().await;
                }
                authority.approve_with("csr-0", &ca).await;
            })
        };

        let identity = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await
            .unwrap();
        approver.await.unwrap();

        assert_eq!(identity.server_url(), "https://10.0.0.1:443");
        assert_eq!(authority.calls.watches(), 1);
        assert_eq!(authority.calls.deletes(), 1);
    }

    #[tokio::test]
    async fn test_point_read_failure_falls_back_to_watch() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::AutoApprove(ca.clone())));
        authority.fail_gets(1);

        let result = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(authority.calls.gets(), 1);
        assert_eq!(authority.calls.watches(), 1);
    }

    #[tokio::test]
    async fn test_denied_is_terminal_and_cleans_up() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Deny));

        let err = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Denied { ref reason, .. } if reason == "PolicyDenied"));
        assert_eq!(authority.calls.deletes(), 1);
        assert_eq!(authority.len().await, 0);
    }

    #[tokio::test]
    async fn test_denied_wins_over_approved_in_same_update() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Manual));

        let decider = {
            let authority = authority.clone();
            tokio::spawn(async move {
                while authority.calls.watches() == 0 {
                    tokio::task::yield_now().await;
                }
                authority
                    .set_status(
                        "csr-0",
                        SigningRequestStatus {
                            conditions: vec![
                                RequestCondition::approved("AutoApproved"),
                                RequestCondition::denied("Revoked", "changed our mind"),
                            ],
                            certificate: Some(b"CERT".to_vec()),
                        },
                    )
                    .await;
            })
        };

        let err = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await
            .unwrap_err();
        decider.await.unwrap();

        match err {
            BootstrapError::Denied { reason, message } => {
                assert_eq!(reason, "Revoked");
                assert_eq!(message, "changed our mind");
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_certificate_without_condition_is_success() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Manual));
        let key = generate_key().unwrap();
        let bootstrap = client(&authority);

        let record = bootstrap.submit_csr(&key, "worker-1").await.unwrap();
        let request = String::from_utf8(record.request.clone()).unwrap();
        let signed = ca.sign_csr(&request, 30).unwrap();
        authority
            .set_status(
                &record.name,
                SigningRequestStatus {
                    conditions: vec![],
                    certificate: Some(signed.cert_pem.clone().into_bytes()),
                },
            )
            .await;

        let cert = bootstrap
            .await_decision(&record.name, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cert, signed.cert_pem.into_bytes());

        let identity = build_final_config(bare_for(&ca), &key, "worker-1", cert).unwrap();
        assert_eq!(identity.client_key_pem(), key.serialize_pem().as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deletes_record_once() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Manual));

        let err = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Timeout(t) if t == TIMEOUT));
        assert_eq!(authority.calls.deletes(), 1);
        assert_eq!(authority.len().await, 0);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_watch_and_cleans_up() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Manual));
        let shutdown = CancellationToken::new();

        let canceller = {
            let authority = authority.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while authority.calls.watches() == 0 {
                    tokio::task::yield_now().await;
                }
                shutdown.cancel();
            })
        };

        let err = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &shutdown)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, BootstrapError::Cancelled));
        assert_eq!(authority.calls.deletes(), 1);
        assert_eq!(authority.len().await, 0);
    }

    #[tokio::test]
    async fn test_cancellation_while_submitting() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Manual));
        authority.hang_creates();
        let shutdown = CancellationToken::new();

        let canceller = {
            let authority = authority.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while authority.calls.creates() == 0 {
                    tokio::task::yield_now().await;
                }
                shutdown.cancel();
            })
        };

        let err = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &shutdown)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, BootstrapError::Cancelled));
        assert_eq!(authority.calls.watches(), 0);
        assert_eq!(authority.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_delete_is_bounded() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::AutoApprove(ca.clone())));
        authority.hang_deletes();

        let started = tokio::time::Instant::now();
        let result = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(authority.calls.deletes(), 1);
        assert!(started.elapsed() >= CLEANUP_TIMEOUT);
    }

    #[tokio::test]
    async fn test_later_denial_overrides_earlier_approval() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Manual));

        let decider = {
            let authority = authority.clone();
            tokio::spawn(async move {
                while authority.calls.watches() == 0 {
                    tokio::task::yield_now().await;
                }
                authority
                    .set_status(
                        "csr-0",
                        SigningRequestStatus {
                            conditions: vec![RequestCondition::approved("AutoApproved")],
                            certificate: None,
                        },
                    )
                    .await;
                authority
                    .set_status(
                        "csr-0",
                        SigningRequestStatus {
                            conditions: vec![RequestCondition::denied("Revoked", "node retired")],
                            certificate: None,
                        },
                    )
                    .await;
            })
        };

        let err = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await
            .unwrap_err();
        decider.await.unwrap();

        assert!(matches!(err, BootstrapError::Denied { ref reason, .. } if reason == "Revoked"));
        assert_eq!(authority.calls.deletes(), 1);
    }

    #[tokio::test]
    async fn test_closed_watch_is_reported() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Manual));
        authority.fail_watches(1);

        let err = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::WatchClosed));
        assert_eq!(authority.calls.deletes(), 1);
    }

    #[tokio::test]
    async fn test_delete_failure_is_not_fatal() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::AutoApprove(ca.clone())));
        authority.fail_deletes(1);

        let result = client(&authority)
            .request_identity(bare_for(&ca), "worker-1", &CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(authority.calls.deletes(), 1);
    }

    #[tokio::test]
    async fn test_dropped_flow_still_deletes() {
        let ca = root();
        let authority = Arc::new(InMemoryApprovalAuthority::new(Policy::Manual));

        let task = {
            let authority = authority.clone();
            let bare = bare_for(&ca);
            tokio::spawn(async move {
                client(&authority)
                    .request_identity(bare, "worker-1", &CancellationToken::new())
                    .await
            })
        };
        while authority.calls.watches() == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;

        while authority.calls.deletes() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(authority.calls.deletes(), 1);
        assert!(authority.record("csr-0").await.is_none());
    }

    #[test]
    fn test_final_config_rejects_foreign_key() {
        let ca = root();
        let other = root();
        let key = generate_key().unwrap();

        // Signed for a different key.
        let stranger = generate_key().unwrap();
        let csr = encode_csr(&stranger, "worker-1").unwrap();
        let cert = ca.sign_csr(&csr, 30).unwrap().cert_pem.into_bytes();
        assert!(matches!(
            build_final_config(bare_for(&ca), &key, "worker-1", cert),
            Err(BootstrapError::InvalidCertificate(_))
        ));

        // Signed by a different root.
        let csr = encode_csr(&key, "worker-1").unwrap();
        let cert = other.sign_csr(&csr, 30).unwrap().cert_pem.into_bytes();
        assert!(matches!(
            build_final_config(bare_for(&ca), &key, "worker-1", cert),
            Err(BootstrapError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_approval_error_passes_through() {
        let err: BootstrapError = ApprovalError::NotFound("csr-0".to_string()).into();
        assert_eq!(err.to_string(), "signing request not found: csr-0");
    }
}
