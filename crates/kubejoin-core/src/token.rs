//! Bootstrap token generation and validation.
//!
//! Bootstrap tokens authenticate a joining node's certificate signing
//! request. The canonical form is `<id>.<secret>`: a 6 hex character ID
//! used as a non-secret lookup key, and 8 random bytes hex encoded as the
//! secret.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ErrorKind;

/// Length of the token ID, in hex characters.
pub const TOKEN_ID_LEN: usize = 6;

/// Length of the token secret, in bytes.
pub const TOKEN_SECRET_BYTES: usize = 8;

/// Errors produced while generating, parsing or authenticating tokens.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not in 2-part dot-separated format")]
    Format,

    #[error("length of token ID is incorrect [{0} (given) != 6 (expected)]")]
    IdLength(usize),

    #[error("token ID must contain only hex characters")]
    IdNotHex,

    #[error("token secret is not valid hex: {0}")]
    SecretEncoding(String),

    #[error("length of token secret is incorrect [{0} (given) != 8 (expected)]")]
    SecretLength(usize),

    #[error("failed to read from the system random source: {0}")]
    Entropy(String),

    #[error("token '{0}' does not match")]
    Mismatch(String),

    #[error("token '{0}' has expired")]
    Expired(String),

    #[error("token '{0}' has already been used")]
    Consumed(String),
}

impl TokenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Entropy(_) => ErrorKind::Crypto,
            Self::Mismatch(_) | Self::Expired(_) | Self::Consumed(_) => ErrorKind::Protocol,
            _ => ErrorKind::Configuration,
        }
    }
}

/// A parsed bootstrap token.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    id: String,
    secret: [u8; TOKEN_SECRET_BYTES],
}

impl BootstrapToken {
    /// Generate a fresh token from the operating system's CSPRNG.
    ///
    /// `OsRng` holds no shared state, so concurrent callers never race.
    pub fn generate() -> Result<Self, TokenError> {
        let mut id_bytes = [0u8; TOKEN_ID_LEN / 2];
        let mut secret = [0u8; TOKEN_SECRET_BYTES];

        OsRng
            .try_fill_bytes(&mut id_bytes)
            .map_err(|e| TokenError::Entropy(e.to_string()))?;
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|e| TokenError::Entropy(e.to_string()))?;

        Ok(Self {
            id: hex::encode(id_bytes),
            secret,
        })
    }

    /// Parse and validate a token in `<id>.<secret>` form.
    ///
    /// Hex digits are accepted in either case; nothing else is normalized.
    pub fn validate(raw: &str) -> Result<Self, TokenError> {
        let lowered = raw.to_ascii_lowercase();
        let mut parts = lowered.split('.');

        let (id, secret) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(secret), None) if !id.is_empty() && !secret.is_empty() => {
                (id, secret)
            }
            _ => return Err(TokenError::Format),
        };

        if id.len() != TOKEN_ID_LEN {
            return Err(TokenError::IdLength(id.len()));
        }
        if !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TokenError::IdNotHex);
        }

        let decoded = hex::decode(secret).map_err(|e| TokenError::SecretEncoding(e.to_string()))?;
        let secret: [u8; TOKEN_SECRET_BYTES] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| TokenError::SecretLength(decoded.len()))?;

        Ok(Self {
            id: id.to_string(),
            secret,
        })
    }

    /// The non-secret token ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The raw secret bytes.
    pub fn secret(&self) -> &[u8; TOKEN_SECRET_BYTES] {
        &self.secret
    }

    /// The canonical `<id>.<secret>` string, as exchanged out of band and
    /// presented as a bearer credential.
    pub fn combined_form(&self) -> String {
        format!("{}.{}", self.id, hex::encode(self.secret))
    }
}

impl FromStr for BootstrapToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::validate(s)
    }
}

impl fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.combined_form())
    }
}

impl fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't expose the secret in debug output
        f.debug_struct("BootstrapToken")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A bootstrap token as remembered by the issuing side.
/// We never store the plaintext secret - only its SHA-256 hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Token ID (lookup key).
    pub token_id: String,

    /// SHA-256 hash of the secret (hex encoded).
    pub secret_hash: String,

    /// When the token was created.
    pub created_at: DateTime<Utc>,

    /// When the token expires.
    pub expires_at: DateTime<Utc>,

    /// Whether the token has been consumed.
    pub consumed: bool,
}

impl TokenRecord {
    /// Record a freshly issued token that stays valid for `ttl`.
    pub fn issue(token: &BootstrapToken, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            token_id: token.id().to_string(),
            secret_hash: hash_secret(token.secret()),
            created_at: now,
            expires_at: now + ttl,
            consumed: false,
        }
    }

    /// Check if the token is valid (not expired and not consumed).
    pub fn is_valid(&self) -> bool {
        !self.consumed && Utc::now() < self.expires_at
    }

    /// Mark the token as consumed.
    pub fn consume(&mut self) {
        self.consumed = true;
    }

    /// Check a presented token against this record and consume it on success.
    pub fn authenticate(&mut self, presented: &BootstrapToken) -> Result<(), TokenError> {
        if presented.id() != self.token_id || hash_secret(presented.secret()) != self.secret_hash {
            return Err(TokenError::Mismatch(presented.id().to_string()));
        }
        if self.consumed {
            return Err(TokenError::Consumed(self.token_id.clone()));
        }
        if Utc::now() >= self.expires_at {
            return Err(TokenError::Expired(self.token_id.clone()));
        }
        self.consume();
        Ok(())
    }
}

/// Hash a token secret using SHA-256.
pub fn hash_secret(secret: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hex::encode(hasher.finalize())
}
