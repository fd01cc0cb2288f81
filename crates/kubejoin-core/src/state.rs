//! Join state of a node agent.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a node agent is in the join sequence.
///
/// Transitions only move forward one step at a time; `Running` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinState {
    /// Freshly started agent with no role or trust information.
    #[default]
    Pending,
    /// Resolving control-plane endpoints and the trust anchor.
    Discovering,
    /// Exchanging the bootstrap token for a client identity.
    Bootstrapping,
    /// Operating with the issued identity.
    Running,
}

/// Attempted transition that is not a single forward step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JoinState,
    pub to: JoinState,
}

impl JoinState {
    /// Returns true if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// The only state this one may advance to.
    pub fn successor(&self) -> Option<JoinState> {
        match self {
            Self::Pending => Some(Self::Discovering),
            Self::Discovering => Some(Self::Bootstrapping),
            Self::Bootstrapping => Some(Self::Running),
            Self::Running => None,
        }
    }

    /// Validate a transition to `to`.
    pub fn advance_to(self, to: JoinState) -> Result<JoinState, InvalidTransition> {
        if self.successor() == Some(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Discovering => "Discovering",
            Self::Bootstrapping => "Bootstrapping",
            Self::Running => "Running",
        };
        f.write_str(name)
    }
}
