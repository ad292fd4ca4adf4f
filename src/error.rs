//! Error types for certloader

use std::io;

use thiserror::Error;

/// Result type alias for certloader
pub type Result<T> = std::result::Result<T, Error>;

/// Why a certificate/key pair could not be turned into a usable credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Certificate or key bytes are empty
    #[error("empty {0} data")]
    EmptyInput(&'static str),

    /// No decodable PEM certificate block
    #[error("certificate is not valid PEM: {0}")]
    CertDecode(String),

    /// PEM block decoded but is not a well-formed X.509 certificate
    #[error("certificate is not a well-formed X.509 structure: {0}")]
    CertStructure(String),

    /// No decodable PEM private key block
    #[error("private key is not valid PEM: {0}")]
    KeyDecode(String),

    /// PEM block decoded but is not a supported private key
    #[error("private key structure is not supported: {0}")]
    KeyStructure(String),

    /// Payload is missing one of the configured fields
    #[error("secret payload has no '{0}' field")]
    MissingField(String),
}

/// Failure looking up a credential in the cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// No credential was ever installed under this name
    #[error("no credential loaded for '{0}'")]
    NotFound(String),

    /// The credential was installed and later cleared
    #[error("credential for '{0}' was deleted")]
    Empty(String),
}

/// Failure establishing or reading a change feed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// The feed could not be opened
    #[error("failed to watch '{secret}': {reason}")]
    Establish {
        /// Secret being watched
        secret: String,
        /// Underlying cause
        reason: String,
    },

    /// The feed broke after it was opened
    #[error("watch on '{secret}' failed: {reason}")]
    Stream {
        /// Secret being watched
        secret: String,
        /// Underlying cause
        reason: String,
    },
}

/// The readiness gate gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    /// Nothing was loaded before the deadline
    #[error("no credential loaded within {0:?}")]
    Timeout(std::time::Duration),
}

/// certloader errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate or key could not be parsed
    #[error("Credential parse error: {0}")]
    Parse(#[from] ParseError),

    /// Credential lookup failed
    #[error("Credential unavailable: {0}")]
    Credential(#[from] CacheError),

    /// Change feed error
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    /// Readiness gate timed out
    #[error("Readiness error: {0}")]
    Readiness(#[from] ReadinessError),

    /// No executor is registered for the access strategy
    #[error("Unsupported access strategy: {0}")]
    UnsupportedAccessStrategy(String),

    /// Document URL could not be parsed
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Parser error
        source: url::ParseError,
    },

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// `true` when the access strategy has no registered executor.
    ///
    /// Callers use this to skip a document instead of aborting a whole run.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedAccessStrategy(_))
    }

    /// `true` when the failure is a missing or deleted credential.
    #[must_use]
    pub fn is_credential_unavailable(&self) -> bool {
        matches!(self, Self::Credential(_))
    }
}
