//! The approval authority: the external party that holds signing requests
//! and decides them.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use kubejoin_core::SigningRequestRecord;

use crate::error::ApprovalError;

pub mod http;
#[cfg(test)]
pub(crate) mod memory;

pub use http::HttpApprovalAuthority;

/// Stream of status updates for one signing request.
pub type RecordStream = BoxStream<'static, Result<SigningRequestRecord, ApprovalError>>;

/// Create/Get/Watch/Delete on named signing-request records.
///
/// Implementations authenticate with whatever credential they were built
/// with; callers never see it.
#[async_trait]
pub trait ApprovalAuthority: Send + Sync {
    /// Submit a PEM-encoded PKCS#10 request. The authority assigns the name.
    async fn create(&self, request_pem: &[u8]) -> Result<SigningRequestRecord, ApprovalError>;

    /// Read the current state of a record.
    async fn get(&self, name: &str) -> Result<SigningRequestRecord, ApprovalError>;

    /// Subscribe to changes of one record.
    ///
    /// The stream ends when the authority closes the subscription.
    async fn watch(&self, name: &str) -> Result<RecordStream, ApprovalError>;

    /// Remove a record.
    async fn delete(&self, name: &str) -> Result<(), ApprovalError>;
}
