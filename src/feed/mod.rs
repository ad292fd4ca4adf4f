//! Change feeds: "watch a named secret" as an abstract capability.
//!
//! The loader only sees [`ChangeFeed`] and the [`SecretEvent`] stream it
//! returns.  Adapters translate a concrete secret source into that shape once,
//! at the boundary:
//!
//! - [`file::FileChangeFeed`] — a mounted-secret directory per secret
//! - `kubernetes::KubeSecretFeed` — a Kubernetes `Secret` (feature `kubernetes`)

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, WatchError};

pub mod file;
#[cfg(feature = "kubernetes")]
pub mod kubernetes;

pub use file::FileChangeFeed;
#[cfg(feature = "kubernetes")]
pub use kubernetes::KubeSecretFeed;

/// Stream of events for one watched secret.  Ends when the feed closes.
pub type SecretEventStream = BoxStream<'static, SecretEvent>;

/// Source of change notifications for named secrets.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a feed scoped to exactly `secret`.
    ///
    /// The current state of the secret, if it exists, is delivered first as
    /// [`SecretEvent::Added`].
    async fn watch(&self, secret: &str) -> Result<SecretEventStream, WatchError>;
}

/// One notification from a change feed.
#[derive(Debug, Clone)]
pub enum SecretEvent {
    /// The secret appeared (or was listed on watch start).
    Added(RawSecretPayload),
    /// The secret's data changed.
    Modified(RawSecretPayload),
    /// The secret was removed.
    Deleted,
    /// The feed broke; the watch must be re-established.
    Error(WatchError),
}

impl SecretEvent {
    /// Short name for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted => "deleted",
            Self::Error(_) => "error",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload
// ─────────────────────────────────────────────────────────────────────────────

/// Field name → bytes, as stored in the secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RawSecretPayload {
    data: HashMap<String, Vec<u8>>,
}

impl RawSecretPayload {
    /// Wrap the secret's data map.
    #[must_use]
    pub fn new(data: HashMap<String, Vec<u8>>) -> Self {
        Self { data }
    }

    /// Bytes of one field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.data.get(name).map(Vec::as_slice)
    }

    /// Certificate and key bytes selected by `fields`.
    ///
    /// # Errors
    ///
    /// [`ParseError::MissingField`] naming the first absent field.
    pub fn key_pair(&self, fields: &SecretFields) -> Result<(&[u8], &[u8]), ParseError> {
        let cert = self
            .field(&fields.cert_field)
            .ok_or_else(|| ParseError::MissingField(fields.cert_field.clone()))?;
        let key = self
            .field(&fields.key_field)
            .ok_or_else(|| ParseError::MissingField(fields.key_field.clone()))?;
        Ok((cert, key))
    }
}

impl fmt::Debug for RawSecretPayload {
    // Field names only; values are key material.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.data.keys().collect();
        keys.sort();
        f.debug_struct("RawSecretPayload")
            .field("fields", &keys)
            .finish()
    }
}

/// Where the certificate and the key live inside a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretFields {
    /// Field holding the PEM certificate chain.
    pub cert_field: String,
    /// Field holding the PEM private key.
    pub key_field: String,
}

impl Default for SecretFields {
    fn default() -> Self {
        Self {
            cert_field: "tls.crt".to_string(),
            key_field: "tls.key".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Secret references
// ─────────────────────────────────────────────────────────────────────────────

/// A `namespace/name` secret reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    /// Namespace (or top-level directory for file feeds).
    pub namespace: String,
    /// Secret name.
    pub name: String,
}

impl SecretRef {
    /// Parse `namespace/name`, or a bare `name` in `default_namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Establish`] for empty segments or more than one `/`.
    pub fn parse(secret: &str, default_namespace: &str) -> Result<Self, WatchError> {
        let invalid = |reason: &str| WatchError::Establish {
            secret: secret.to_string(),
            reason: reason.to_string(),
        };

        let (namespace, name) = match secret.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (default_namespace, secret),
        };
        if name.contains('/') {
            return Err(invalid("expected 'namespace/name'"));
        }
        if namespace.is_empty() || name.is_empty() {
            return Err(invalid("namespace and name must be non-empty"));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
