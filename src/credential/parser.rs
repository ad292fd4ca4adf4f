//! PEM decoding of certificate/key pairs into usable client credentials.
//!
//! Provides:
//! - [`parse_credential`] — certificate chain + private key bytes → [`ParsedCredential`]
//! - [`load_certs`] — PEM file with CA certificates (used for trust bundles)
//!
//! # File format
//!
//! All certificate and key material is expected in **PEM format**.  DER is not
//! supported to keep operator tooling simple (openssl, cfssl, cert-manager all
//! default to PEM).
//!
//! # Limitations
//!
//! The certificate and key are **not** checked to belong together.  A secret
//! holding a certificate for one key and a different private key parses fine
//! and fails later, at the TLS handshake.

use std::fmt;
use std::fs;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls_pemfile::Item;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use super::identity::CredentialInfo;
use crate::error::ParseError;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Parsed credential
// ─────────────────────────────────────────────────────────────────────────────

/// A validated client certificate chain and its private key.
///
/// Immutable once built; replaced as a whole when the underlying secret
/// rotates.
pub struct ParsedCredential {
    certified_key: Arc<CertifiedKey>,
    private_key: PrivateKeyDer<'static>,
    info: CredentialInfo,
}

impl ParsedCredential {
    /// rustls view of the credential, ready to hand to a client-cert resolver.
    #[must_use]
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// Full certificate chain, leaf first.
    #[must_use]
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    /// DER of the private key as it was decoded from the secret.
    #[must_use]
    pub fn private_key_der(&self) -> &[u8] {
        self.private_key.secret_der()
    }

    /// Identity and validity metadata of the leaf certificate.
    #[must_use]
    pub fn info(&self) -> &CredentialInfo {
        &self.info
    }
}

impl fmt::Debug for ParsedCredential {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedCredential")
            .field("subject", &self.info.subject)
            .field("chain_len", &self.certified_key.cert.len())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Decode a PEM certificate chain and PEM private key into a [`ParsedCredential`].
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and SEC1 EC
/// (`EC PRIVATE KEY`) keys.
///
/// # Errors
///
/// Each failure maps to its own [`ParseError`] variant: empty input, PEM
/// decoding of the certificate, X.509 structure of the certificate, PEM
/// decoding of the key, and key structure.
pub fn parse_credential(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> std::result::Result<ParsedCredential, ParseError> {
    if cert_pem.is_empty() {
        return Err(ParseError::EmptyInput("certificate"));
    }
    if key_pem.is_empty() {
        return Err(ParseError::EmptyInput("private key"));
    }

    let chain = decode_cert_chain(cert_pem)?;
    let info = inspect_leaf(&chain)?;

    let private_key = decode_private_key(key_pem)?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| ParseError::KeyStructure(e.to_string()))?;

    Ok(ParsedCredential {
        certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
        private_key,
        info,
    })
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data =
        fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

/// PEM items in `input`, in order. Blocks with unknown labels are skipped.
fn decode_pem(input: &[u8]) -> std::result::Result<Vec<Item>, String> {
    rustls_pemfile::read_all(&mut &*input)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())
}

fn decode_cert_chain(
    cert_pem: &[u8],
) -> std::result::Result<Vec<CertificateDer<'static>>, ParseError> {
    let items = decode_pem(cert_pem).map_err(ParseError::CertDecode)?;
    if items.is_empty() {
        return Err(ParseError::CertDecode("no PEM block found".to_string()));
    }

    let chain: Vec<CertificateDer<'static>> = items
        .into_iter()
        .filter_map(|item| match item {
            Item::X509Certificate(der) => Some(der),
            _ => None,
        })
        .collect();
    if chain.is_empty() {
        return Err(ParseError::CertStructure(
            "PEM block is not a CERTIFICATE".to_string(),
        ));
    }
    Ok(chain)
}

/// Every block in the chain must be well-formed; metadata comes from the leaf.
fn inspect_leaf(
    chain: &[CertificateDer<'static>],
) -> std::result::Result<CredentialInfo, ParseError> {
    for der in &chain[1..] {
        X509Certificate::from_der(der)
            .map_err(|e| ParseError::CertStructure(format!("intermediate: {e}")))?;
    }
    CredentialInfo::from_der(&chain[0]).map_err(|e| ParseError::CertStructure(e.to_string()))
}

fn decode_private_key(key_pem: &[u8]) -> std::result::Result<PrivateKeyDer<'static>, ParseError> {
    let items = decode_pem(key_pem).map_err(ParseError::KeyDecode)?;
    if items.is_empty() {
        return Err(ParseError::KeyDecode("no PEM block found".to_string()));
    }

    items
        .into_iter()
        .find_map(|item| match item {
            Item::Pkcs1Key(key) => Some(PrivateKeyDer::from(key)),
            Item::Pkcs8Key(key) => Some(PrivateKeyDer::from(key)),
            Item::Sec1Key(key) => Some(PrivateKeyDer::from(key)),
            _ => None,
        })
        .ok_or_else(|| ParseError::KeyStructure("PEM block is not a private key".to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
