//! Bootstrap parameters handed from the operator tooling to the node agent.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::DiscoveryConfig;
use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum ParamsError {
    /// The agent is probably already running with these parameters; it must
    /// be stopped and the file removed before writing new ones.
    #[error("bootstrap parameters already exist at {0}")]
    AlreadyExists(PathBuf),

    #[error("failed to access bootstrap parameters at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid bootstrap parameters: {0}")]
    Json(#[from] serde_json::Error),
}

impl ParamsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            _ => ErrorKind::Configuration,
        }
    }
}

/// Role hint for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Node,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapParams {
    pub api_version: String,
    pub role: Role,
    pub discovery: DiscoveryConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl BootstrapParams {
    pub fn new(role: Role, discovery: DiscoveryConfig, token: Option<String>) -> Self {
        Self {
            api_version: "v1alpha1".to_string(),
            role,
            discovery,
            token,
        }
    }

    /// Write the parameters as JSON, refusing to replace an existing file.
    pub fn write_if_not_exists(&self, path: &Path) -> Result<(), ParamsError> {
        let serialized = serde_json::to_vec_pretty(self)?;

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => ParamsError::AlreadyExists(path.to_path_buf()),
            _ => ParamsError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;

        file.write_all(&serialized).map_err(|e| ParamsError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ParamsError> {
        let data = std::fs::read(path).map_err(|e| ParamsError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_slice(&data)?)
    }
}
