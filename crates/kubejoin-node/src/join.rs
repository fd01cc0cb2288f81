//! Join state machine for a node agent.
//!
//! `Pending -> Discovering -> Bootstrapping -> Running`, one step at a time.
//! Each handler computes a [`Transition`] without touching the machine;
//! [`JoinMachine::step`] checks the move is legal and only then applies it.

use std::path::Path;
use std::sync::Arc;

use kubejoin_core::{BareConfig, BootstrapToken, ClientIdentity, DiscoveryConfig, JoinState};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::approval::{ApprovalAuthority, HttpApprovalAuthority};
use crate::bootstrap::{build_bare_config, BootstrapClient};
use crate::config::JoinConfig;
use crate::discovery::{Discovered, DiscoveryProvider};
use crate::error::{ApprovalError, BootstrapError, JoinError};
use crate::retry::retry_transient;

/// Builds an approval authority client for one endpoint.
pub trait AuthorityConnector: Send + Sync {
    fn connect(
        &self,
        bare: &BareConfig,
        token: &BootstrapToken,
    ) -> Result<Arc<dyn ApprovalAuthority>, ApprovalError>;
}

/// Connects over HTTPS, trusting only the discovered anchor.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

impl AuthorityConnector for HttpConnector {
    fn connect(
        &self,
        bare: &BareConfig,
        token: &BootstrapToken,
    ) -> Result<Arc<dyn ApprovalAuthority>, ApprovalError> {
        Ok(Arc::new(HttpApprovalAuthority::new(bare, token.clone())?))
    }
}

/// What a completed state contributes to the machine.
#[derive(Debug)]
pub enum Effect {
    TokenValidated(BootstrapToken),
    Discovered(Discovered),
    IdentityIssued(ClientIdentity),
}

#[derive(Debug)]
pub struct Transition {
    pub next: JoinState,
    pub effect: Effect,
}

pub struct JoinMachine<C = HttpConnector> {
    config: JoinConfig,
    connector: C,
    raw_token: Option<String>,
    discovery: Option<DiscoveryConfig>,
    state: JoinState,
    token: Option<BootstrapToken>,
    discovered: Option<Discovered>,
    identity: Option<ClientIdentity>,
}

impl JoinMachine<HttpConnector> {
    pub fn new(
        config: JoinConfig,
        raw_token: Option<String>,
        discovery: Option<DiscoveryConfig>,
    ) -> Self {
        Self::with_connector(config, HttpConnector, raw_token, discovery)
    }
}

impl<C: AuthorityConnector> JoinMachine<C> {
    pub fn with_connector(
        config: JoinConfig,
        connector: C,
        raw_token: Option<String>,
        discovery: Option<DiscoveryConfig>,
    ) -> Self {
        Self {
            config,
            connector,
            raw_token,
            discovery,
            state: JoinState::Pending,
            token: None,
            discovered: None,
            identity: None,
        }
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    /// Validate the token and discovery inputs, then start discovery.
    pub fn on_pending(&self) -> Result<Transition, JoinError> {
        let raw = self.raw_token.as_deref().ok_or(JoinError::MissingToken)?;
        let token = BootstrapToken::validate(raw)?;
        let discovery = self.discovery.as_ref().ok_or(JoinError::MissingDiscovery)?;
        discovery.start()?;

        info!(token_id = %token.id(), mechanism = discovery.kind_name(), "Join inputs validated");
        Ok(Transition {
            next: JoinState::Discovering,
            effect: Effect::TokenValidated(token),
        })
    }

    /// Resolve endpoints and trust anchor.
    pub fn on_discovering(&self) -> Result<Transition, JoinError> {
        let discovery = self.discovery.as_ref().ok_or(JoinError::MissingDiscovery)?;
        let discovered = discovery.discover()?;

        info!(endpoints = ?discovered.server_urls, "Discovered control plane");
        Ok(Transition {
            next: JoinState::Bootstrapping,
            effect: Effect::Discovered(discovered),
        })
    }

    /// Exchange the token for an identity, retrying transient failures.
    pub async fn on_bootstrapping(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Transition, JoinError> {
        let token = self.token.as_ref().ok_or(JoinError::MissingToken)?;
        let discovered = self.discovered.as_ref().ok_or(JoinError::MissingDiscovery)?;
        let endpoints = &discovered.server_urls;
        if endpoints.is_empty() {
            return Err(BootstrapError::NoEndpoints.into());
        }

        let identity = retry_transient(&self.config.retry, "bootstrap", shutdown, move |attempt| {
            let index = if self.config.endpoint_failover {
                attempt as usize % endpoints.len()
            } else {
                0
            };
            async move {
                let bare = build_bare_config(&self.config.cluster_name, discovered, index)?;
                self.attempt_bootstrap(bare, token, shutdown).await
            }
        })
        .await?;

        Ok(Transition {
            next: JoinState::Running,
            effect: Effect::IdentityIssued(identity),
        })
    }

    async fn attempt_bootstrap(
        &self,
        bare: BareConfig,
        token: &BootstrapToken,
        shutdown: &CancellationToken,
    ) -> Result<ClientIdentity, BootstrapError> {
        info!(endpoint = %bare.server_url, "Starting TLS bootstrap");
        let authority = self.connector.connect(&bare, token)?;
        BootstrapClient::new(authority, self.config.watch_timeout)
            .request_identity(bare, &self.config.node_name, shutdown)
            .await
    }

    /// Run the handler for the current state and apply its transition.
    pub async fn step(&mut self, shutdown: &CancellationToken) -> Result<JoinState, JoinError> {
        let transition = match self.state {
            JoinState::Pending => self.on_pending()?,
            JoinState::Discovering => self.on_discovering()?,
            JoinState::Bootstrapping => self.on_bootstrapping(shutdown).await?,
            JoinState::Running => return Ok(JoinState::Running),
        };

        let next = self.state.advance_to(transition.next)?;

        match transition.effect {
            Effect::TokenValidated(token) => self.token = Some(token),
            Effect::Discovered(discovered) => self.discovered = Some(discovered),
            Effect::IdentityIssued(identity) => {
                if let Some(path) = &self.config.kubeconfig_path {
                    write_kubeconfig(path, &identity)?;
                    info!(path = %path.display(), "Wrote kubeconfig");
                }
                // The token is superseded by the issued identity.
                self.token = None;
                self.identity = Some(identity);
            }
        }

        info!(from = %self.state, to = %next, "Join state transition");
        self.state = next;
        Ok(next)
    }

    /// Drive the machine until it is running.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<ClientIdentity, JoinError> {
        while !self.state.is_terminal() {
            if let Err(e) = self.step(shutdown).await {
                warn!(state = %self.state, kind = %e.kind(), error = %e, "Join failed");
                return Err(e);
            }
        }
        self.identity.clone().ok_or(JoinError::NoIdentity)
    }
}

fn write_kubeconfig(path: &Path, identity: &ClientIdentity) -> Result<(), JoinError> {
    let yaml = identity
        .to_yaml()
        .map_err(|e| JoinError::Render(e.to_string()))?;
    let err = |e: std::io::Error| JoinError::WriteKubeconfig {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(err)?;
    }
    std::fs::write(path, yaml).map_err(err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(err)?;
    }
    Ok(())
}
