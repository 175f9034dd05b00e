//! Error taxonomy shared by every store.
//!
//! Errors are leaf values. Callers (HTTP handlers, CLI) classify them with
//! [`Error::kind`] and map the kind to a status code; nothing in the core
//! retries or translates beyond that.
//!
//! | Kind | Typical cause | Status |
//! |------|---------------|--------|
//! | `Validation` | missing field, out-of-range value, bad format | 400 |
//! | `NotFound` | lookup by id or natural key failed | 404 |
//! | `Conflict` | state-machine precondition, duplicate natural key | 409 |
//! | `Io` | file or HTTP failure in a collaborator-facing component, corrupt on-disk data | 502 |

use std::fmt;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Input failed validation.
    Validation,
    /// Entity lookup failed.
    NotFound,
    /// State-machine or uniqueness precondition failed.
    Conflict,
    /// File, network, or codec failure.
    Io,
}

impl ErrorKind {
    /// HTTP status code a transport layer should use for this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Io => 502,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Io => write!(f, "io"),
        }
    }
}

/// Error type for control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input failed validation.
    #[error("{0}")]
    Validation(String),

    /// Entity was not found.
    #[error("{0}")]
    NotFound(String),

    /// State-machine precondition or uniqueness constraint failed.
    #[error("{0}")]
    Conflict(String),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound HTTP failure.
    #[error("http error: {0}")]
    Http(String),

    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML decode failure.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Encryption or decryption failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Yaml(_) | Self::Serialization(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Io(_) | Self::Http(_) | Self::Crypto(_) | Self::Cancelled => ErrorKind::Io,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
