// src/error.rs
// Error taxonomy shared by every module of the client

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Field path -> human readable message, collected by the sanitization layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(pub BTreeMap<String, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.0.insert(field.to_string(), message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field, message)?;
            first = false;
        }
        Ok(())
    }
}

/// Every failure surfaced by the client, one variant per kind.
///
/// Nothing is retried internally: each operation closes whatever resource it
/// owns, then propagates one of these to the caller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(FieldErrors),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("lookup error: {0}")]
    Lookup(String),

    #[error("request refused by server: {0}")]
    ResponseFailure(String),
}

impl ClientError {
    /// Short machine-readable kind name, used by the CLI JSON envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Validation(_) => "ValidationError",
            Self::Transport(_) => "TransportError",
            Self::Crypto(_) => "CryptoError",
            Self::Protocol(_) => "ProtocolError",
            Self::Store(_) => "StoreError",
            Self::Lookup(_) => "LookupError",
            Self::ResponseFailure(_) => "ResponseFailure",
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.push(field, message);
        Self::Validation(errors)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<rusqlite::Error> for ClientError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<rsa::Error> for ClientError {
    fn from(err: rsa::Error) -> Self {
        Self::Crypto(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
