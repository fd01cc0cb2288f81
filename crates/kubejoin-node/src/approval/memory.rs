//! In-memory approval authority for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use kubejoin_core::{
    BootstrapToken, RequestCondition, SigningRequestRecord, SigningRequestStatus, TokenRecord,
};
use kubejoin_pki::CertificateAuthority;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use super::{ApprovalAuthority, RecordStream};
use crate::error::ApprovalError;

/// How the authority reacts to a new request.
pub(crate) enum Policy {
    /// Leave the request pending until the test decides it.
    Manual,
    /// Sign the request immediately with the given CA.
    AutoApprove(Arc<CertificateAuthority>),
    /// Deny the request immediately.
    Deny,
}

#[derive(Default)]
pub(crate) struct Calls {
    pub create: AtomicUsize,
    pub get: AtomicUsize,
    pub watch: AtomicUsize,
    pub delete: AtomicUsize,
}

impl Calls {
    pub fn creates(&self) -> usize {
        self.create.load(Ordering::SeqCst)
    }
    pub fn gets(&self) -> usize {
        self.get.load(Ordering::SeqCst)
    }
    pub fn watches(&self) -> usize {
        self.watch.load(Ordering::SeqCst)
    }
    pub fn deletes(&self) -> usize {
        self.delete.load(Ordering::SeqCst)
    }
}

struct Credential {
    record: std::sync::Mutex<TokenRecord>,
    presented: BootstrapToken,
}

pub(crate) struct InMemoryApprovalAuthority {
    records: Mutex<HashMap<String, SigningRequestRecord>>,
    events: broadcast::Sender<SigningRequestRecord>,
    next_id: AtomicUsize,
    policy: Policy,
    credential: Option<Credential>,
    failing_watches: AtomicUsize,
    failing_gets: AtomicUsize,
    failing_deletes: AtomicUsize,
    hanging_creates: AtomicBool,
    hanging_deletes: AtomicBool,
    pub calls: Calls,
}

impl InMemoryApprovalAuthority {
    pub fn new(policy: Policy) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            records: Mutex::new(HashMap::new()),
            events,
            next_id: AtomicUsize::new(0),
            policy,
            credential: None,
            failing_watches: AtomicUsize::new(0),
            failing_gets: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
            hanging_creates: AtomicBool::new(false),
            hanging_deletes: AtomicBool::new(false),
            calls: Calls::default(),
        }
    }

    /// Require `presented` to authenticate against `record` on create.
    pub fn with_credential(mut self, record: TokenRecord, presented: BootstrapToken) -> Self {
        self.credential = Some(Credential {
            record: std::sync::Mutex::new(record),
            presented,
        });
        self
    }

    /// The next `n` watches end right after the initial snapshot.
    pub fn fail_watches(&self, n: usize) {
        self.failing_watches.store(n, Ordering::SeqCst);
    }

    /// The next `n` point-reads fail.
    pub fn fail_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// The next `n` deletes fail.
    pub fn fail_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    /// Creates never complete, like a server that accepts and goes silent.
    pub fn hang_creates(&self) {
        self.hanging_creates.store(true, Ordering::SeqCst);
    }

    /// Deletes never complete.
    pub fn hang_deletes(&self) {
        self.hanging_deletes.store(true, Ordering::SeqCst);
    }

    pub async fn record(&self, name: &str) -> Option<SigningRequestRecord> {
        self.records.lock().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Replace a record's status and notify watchers.
    pub async fn set_status(&self, name: &str, status: SigningRequestStatus) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(name) {
            record.status = status;
            let _ = self.events.send(record.clone());
        }
    }

    pub async fn approve_with(&self, name: &str, ca: &CertificateAuthority) {
        let request = match self.record(name).await {
            Some(record) => record.request,
            None => return,
        };
        let status = sign(ca, &request);
        self.set_status(name, status).await;
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn sign(ca: &CertificateAuthority, request: &[u8]) -> SigningRequestStatus {
    let pem = String::from_utf8_lossy(request);
    match ca.sign_csr(&pem, 365) {
        Ok(signed) => SigningRequestStatus {
            conditions: vec![RequestCondition::approved("AutoApproved")],
            certificate: Some(signed.cert_pem.into_bytes()),
        },
        Err(e) => SigningRequestStatus {
            conditions: vec![RequestCondition::denied("InvalidRequest", e.to_string())],
            certificate: None,
        },
    }
}

#[async_trait]
impl ApprovalAuthority for InMemoryApprovalAuthority {
    async fn create(&self, request_pem: &[u8]) -> Result<SigningRequestRecord, ApprovalError> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        if self.hanging_creates.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if let Some(credential) = &self.credential {
            let mut record = credential
                .record
                .lock()
                .map_err(|_| ApprovalError::Unavailable("poisoned".to_string()))?;
            record
                .authenticate(&credential.presented)
                .map_err(|e| ApprovalError::Status {
                    code: 401,
                    message: e.to_string(),
                })?;
        }

        let name = format!("csr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let status = match &self.policy {
            Policy::Manual => SigningRequestStatus::default(),
            Policy::AutoApprove(ca) => sign(ca, request_pem),
            Policy::Deny => SigningRequestStatus {
                conditions: vec![RequestCondition::denied("PolicyDenied", "not allowed")],
                certificate: None,
            },
        };

        let record = SigningRequestRecord {
            name: name.clone(),
            request: request_pem.to_vec(),
            status,
        };
        self.records.lock().await.insert(name, record.clone());
        Ok(record)
    }

    async fn get(&self, name: &str) -> Result<SigningRequestRecord, ApprovalError> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_gets) {
            return Err(ApprovalError::Unavailable("injected".to_string()));
        }
        self.record(name)
            .await
            .ok_or_else(|| ApprovalError::NotFound(name.to_string()))
    }

    async fn watch(&self, name: &str) -> Result<RecordStream, ApprovalError> {
        self.calls.watch.fetch_add(1, Ordering::SeqCst);

        // Subscribe before the snapshot so no update falls in between.
        let updates = self.events.subscribe();
        let snapshot = self
            .record(name)
            .await
            .ok_or_else(|| ApprovalError::NotFound(name.to_string()))?;
        let initial = stream::iter(vec![Ok::<_, ApprovalError>(snapshot)]);

        if Self::take_failure(&self.failing_watches) {
            return Ok(initial.boxed());
        }

        let name = name.to_string();
        let updates = BroadcastStream::new(updates).filter_map(move |event| {
            let item = match event {
                Ok(record) if record.name == name => Some(Ok::<_, ApprovalError>(record)),
                _ => None,
            };
            async move { item }
        });

        Ok(initial.chain(updates).boxed())
    }

    async fn delete(&self, name: &str) -> Result<(), ApprovalError> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        if self.hanging_deletes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if Self::take_failure(&self.failing_deletes) {
            return Err(ApprovalError::Unavailable("injected".to_string()));
        }
        self.records
            .lock()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ApprovalError::NotFound(name.to_string()))
    }
}
