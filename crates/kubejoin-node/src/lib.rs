//! kubejoin node agent
//!
//! Everything a joining node does: discover the control plane, exchange a
//! bootstrap token for a client certificate through a signing request, and
//! track its progress through the join states.
//!
//! The node's private key is generated locally and never leaves it.

pub mod approval;
pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod error;
pub mod join;
pub mod retry;

pub use approval::{ApprovalAuthority, HttpApprovalAuthority, RecordStream};
pub use bootstrap::{build_bare_config, build_final_config, BootstrapClient};
pub use config::JoinConfig;
pub use discovery::{Discovered, DiscoveryProvider};
pub use error::{ApprovalError, BootstrapError, DiscoveryError, JoinError};
pub use join::{AuthorityConnector, Effect, HttpConnector, JoinMachine, Transition};
pub use retry::{retry_transient, RetryConfig, Retryable};
