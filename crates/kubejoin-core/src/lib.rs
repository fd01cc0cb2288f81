//! kubejoin Core Domain Types
//!
//! This crate contains the domain model shared by the control-plane and
//! node sides of a cluster join, with no dependencies on:
//! - Network/HTTP
//! - Certificate generation
//! - Runtime specifics
//!
//! File access is limited to persisting [`BootstrapParams`].

pub mod csr;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod params;
pub mod state;
pub mod token;

// Re-export commonly used types
pub use csr::{
    node_identity, ConditionType, Decision, RequestCondition, SigningRequestRecord,
    SigningRequestStatus,
};
pub use discovery::{DiscoveryConfig, GossipDiscovery, OutOfBandDiscovery};
pub use error::ErrorKind;
pub use identity::{BareConfig, ClientIdentity, Kubeconfig};
pub use params::{BootstrapParams, ParamsError, Role};
pub use state::{InvalidTransition, JoinState};
pub use token::{BootstrapToken, TokenError, TokenRecord};
