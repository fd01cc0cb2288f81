//! HTTP approval authority speaking the `certificates.k8s.io/v1`
//! CertificateSigningRequest REST contract.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::stream::{self, BoxStream, StreamExt};
use kubejoin_core::{
    BareConfig, BootstrapToken, RequestCondition, SigningRequestRecord, SigningRequestStatus,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ApprovalAuthority, RecordStream};
use crate::error::ApprovalError;

const CSR_PATH: &str = "/apis/certificates.k8s.io/v1/certificatesigningrequests";
const KUBELET_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client-kubelet";
/// Bound on each create, get and delete. Watches stay open until decided.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Approval authority reached over HTTPS with a bootstrap bearer token.
///
/// Trusts only the CA in the bare config it was built from.
#[derive(Debug)]
pub struct HttpApprovalAuthority {
    inner: reqwest::Client,
    base_url: String,
    token: BootstrapToken,
    request_timeout: Duration,
}

impl HttpApprovalAuthority {
    pub fn new(bare: &BareConfig, token: BootstrapToken) -> Result<Self, ApprovalError> {
        let anchor = reqwest::Certificate::from_pem(&bare.ca_cert_pem)
            .map_err(|e| ApprovalError::TrustAnchor(e.to_string()))?;

        let inner = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(anchor)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            inner,
            base_url: bare.server_url.trim_end_matches('/').to_string(),
            token,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn collection_url(&self) -> String {
        format!("{}{}", self.base_url, CSR_PATH)
    }

    fn item_url(&self, name: &str) -> String {
        format!("{}{}/{}", self.base_url, CSR_PATH, name)
    }
}

#[async_trait]
impl ApprovalAuthority for HttpApprovalAuthority {
    async fn create(&self, request_pem: &[u8]) -> Result<SigningRequestRecord, ApprovalError> {
        let url = self.collection_url();
        debug!(url = %url, "POST signing request");

        let body = json!({
            "apiVersion": "certificates.k8s.io/v1",
            "kind": "CertificateSigningRequest",
            "metadata": { "generateName": "csr-" },
            "spec": {
                "request": STANDARD.encode(request_pem),
                "signerName": KUBELET_CLIENT_SIGNER,
                "usages": ["digital signature", "key encipherment", "client auth"],
            },
        });

        let response = self
            .inner
            .post(&url)
            .bearer_auth(self.token.combined_form())
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, "").await?;
        decode_record(&response.bytes().await?)
    }

    async fn get(&self, name: &str) -> Result<SigningRequestRecord, ApprovalError> {
        let url = self.item_url(name);
        debug!(url = %url, "GET signing request");

        let response = self
            .inner
            .get(&url)
            .bearer_auth(self.token.combined_form())
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = check_status(response, name).await?;
        decode_record(&response.bytes().await?)
    }

    async fn watch(&self, name: &str) -> Result<RecordStream, ApprovalError> {
        let url = self.collection_url();
        let selector = format!("metadata.name={}", name);
        debug!(url = %url, selector = %selector, "WATCH signing request");

        let response = self
            .inner
            .get(&url)
            .bearer_auth(self.token.combined_form())
            .query(&[("watch", "true"), ("fieldSelector", selector.as_str())])
            .send()
            .await?;
        let response = check_status(response, name).await?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(records_from_lines(body))
    }

    async fn delete(&self, name: &str) -> Result<(), ApprovalError> {
        let url = self.item_url(name);
        debug!(url = %url, "DELETE signing request");

        let response = self
            .inner
            .delete(&url)
            .bearer_auth(self.token.combined_form())
            .timeout(self.request_timeout)
            .send()
            .await?;
        check_status(response, name).await?;
        Ok(())
    }
}

async fn check_status(
    response: reqwest::Response,
    name: &str,
) -> Result<reqwest::Response, ApprovalError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ApprovalError::NotFound(name.to_string()));
    }

    let text = response.text().await.unwrap_or_default();
    Err(ApprovalError::Status {
        code: status.as_u16(),
        message: status_message(&text),
    })
}

/// Prefer the `message` of a Status object; fall back to the raw body.
fn status_message(body: &str) -> String {
    serde_json::from_str::<WireStatusObject>(body)
        .ok()
        .and_then(|s| s.message)
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    metadata: WireMeta,
    spec: WireSpec,
    #[serde(default)]
    status: WireStatus,
}

#[derive(Debug, Deserialize)]
struct WireMeta {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireSpec {
    request: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireStatus {
    #[serde(default)]
    conditions: Vec<RequestCondition>,
    #[serde(default)]
    certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStatusObject {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

impl TryFrom<WireRecord> for SigningRequestRecord {
    type Error = ApprovalError;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        let request = STANDARD
            .decode(wire.spec.request.as_bytes())
            .map_err(|e| ApprovalError::Decode(format!("spec.request: {}", e)))?;
        let certificate = wire
            .status
            .certificate
            .map(|c| STANDARD.decode(c.as_bytes()))
            .transpose()
            .map_err(|e| ApprovalError::Decode(format!("status.certificate: {}", e)))?;

        Ok(Self {
            name: wire.metadata.name,
            request,
            status: SigningRequestStatus {
                conditions: wire.status.conditions,
                certificate,
            },
        })
    }
}

fn decode_record(body: &[u8]) -> Result<SigningRequestRecord, ApprovalError> {
    let wire: WireRecord =
        serde_json::from_slice(body).map_err(|e| ApprovalError::Decode(e.to_string()))?;
    wire.try_into()
}

/// Interpret one line of a watch response. Blank lines and bookmarks
/// carry no record.
fn parse_event_line(line: &[u8]) -> Result<Option<SigningRequestRecord>, ApprovalError> {
    let Some(start) = line.iter().position(|b| !b.is_ascii_whitespace()) else {
        return Ok(None);
    };
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .unwrap_or(start);
    let line = &line[start..=end];

    let event: WatchEvent =
        serde_json::from_slice(line).map_err(|e| ApprovalError::Decode(e.to_string()))?;

    match event.kind.as_str() {
        "ADDED" | "MODIFIED" => {
            let wire: WireRecord = serde_json::from_value(event.object)
                .map_err(|e| ApprovalError::Decode(e.to_string()))?;
            wire.try_into().map(Some)
        }
        "DELETED" => {
            let name = event
                .object
                .pointer("/metadata/name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            Err(ApprovalError::Deleted(name))
        }
        "ERROR" => {
            let status: WireStatusObject = serde_json::from_value(event.object)
                .map_err(|e| ApprovalError::Decode(e.to_string()))?;
            Err(ApprovalError::Status {
                code: status.code.unwrap_or(500),
                message: status.message.unwrap_or_default(),
            })
        }
        _ => Ok(None),
    }
}

struct LineReader {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buf: Vec<u8>,
    finished: bool,
}

/// Turn a newline-delimited JSON body into a stream of records.
///
/// The stream ends after the first error or when the body ends.
fn records_from_lines(body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> RecordStream {
    let reader = LineReader {
        body,
        buf: Vec::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if reader.finished {
                return None;
            }

            if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                match parse_event_line(&line) {
                    Ok(None) => continue,
                    Ok(Some(record)) => return Some((Ok(record), reader)),
                    Err(e) => {
                        reader.finished = true;
                        return Some((Err(e), reader));
                    }
                }
            }

            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.finished = true;
                    return Some((Err(e.into()), reader));
                }
                None => {
                    reader.finished = true;
                    let rest = std::mem::take(&mut reader.buf);
                    return match parse_event_line(&rest) {
                        Ok(None) => None,
                        Ok(Some(record)) => Some((Ok(record), reader)),
                        Err(e) => Some((Err(e), reader)),
                    };
                }
            }
        }
    })
    .boxed()
}
