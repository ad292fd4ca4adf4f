//! Name-keyed store of the most recently validated credentials.
//!
//! Readers clone an `Arc<ParsedCredential>` out of the map; writers swap the
//! whole `Arc` in.  A reader therefore sees either the previous credential or
//! the new one, never a mix of the two.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::identity::CredentialInfo;
use super::parser::{ParsedCredential, parse_credential};
use crate::error::{CacheError, ParseError};
use crate::feed::{RawSecretPayload, SecretFields};

/// Per-name cache state.
#[derive(Debug, Clone)]
enum Slot {
    Loaded(Arc<ParsedCredential>),
    /// Loaded once, then deleted at the source.
    Cleared,
}

/// Concurrency-safe credential store shared by loaders, executors and the
/// readiness gate.
///
/// One writer per name is assumed (the loader owning that secret); any number
/// of readers.
#[derive(Debug, Default)]
pub struct CredentialCache {
    entries: DashMap<String, Slot>,
}

impl CredentialCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `credential` under `name`, replacing whatever was there.
    pub fn put(&self, name: &str, credential: ParsedCredential) -> Arc<ParsedCredential> {
        let credential = Arc::new(credential);
        info!(
            secret = name,
            subject = %credential.info().display_name(),
            not_after = ?credential.info().not_after,
            "Credential installed"
        );
        self.entries
            .insert(name.to_string(), Slot::Loaded(Arc::clone(&credential)));
        credential
    }

    /// Parse the configured fields out of `payload` and install the result.
    ///
    /// On any parse failure the previous entry is left untouched, so readers
    /// keep getting the last known-good credential.
    pub fn put_payload(
        &self,
        name: &str,
        payload: &RawSecretPayload,
        fields: &SecretFields,
    ) -> Result<Arc<ParsedCredential>, ParseError> {
        let (cert, key) = payload.key_pair(fields)?;
        let credential = parse_credential(cert, key)?;
        Ok(self.put(name, credential))
    }

    /// Current credential for `name`.
    ///
    /// # Errors
    ///
    /// [`CacheError::NotFound`] if nothing was ever installed under `name`,
    /// [`CacheError::Empty`] if it was installed and later cleared.
    pub fn get(&self, name: &str) -> Result<Arc<ParsedCredential>, CacheError> {
        match self.entries.get(name).as_deref() {
            Some(Slot::Loaded(credential)) => Ok(Arc::clone(credential)),
            Some(Slot::Cleared) => Err(CacheError::Empty(name.to_string())),
            None => Err(CacheError::NotFound(name.to_string())),
        }
    }

    /// Drop the credential for `name`; later lookups fail with
    /// [`CacheError::Empty`].
    ///
    /// Returns `true` if a credential was actually removed.
    pub fn clear(&self, name: &str) -> bool {
        let previous = self.entries.insert(name.to_string(), Slot::Cleared);
        let removed = matches!(previous, Some(Slot::Loaded(_)));
        debug!(secret = name, removed, "Credential cleared");
        removed
    }

    /// `true` when at least one name holds a credential.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry.value(), Slot::Loaded(_)))
    }

    /// Metadata of every loaded credential, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, CredentialInfo)> {
        let mut loaded: Vec<(String, CredentialInfo)> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Loaded(credential) => {
                    Some((entry.key().clone(), credential.info().clone()))
                }
                Slot::Cleared => None,
            })
            .collect();
        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        loaded
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
