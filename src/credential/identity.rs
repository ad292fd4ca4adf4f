//! Certificate metadata extraction.
//!
//! Parses an X.509 DER-encoded certificate and extracts the fields shown to
//! operators: subject, issuer, Common Name, SAN URIs, SAN DNS names and the
//! validity window.

use chrono::{DateTime, Utc};
use serde::Serialize;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;
use x509_parser::time::ASN1Time;

use crate::error::ParseError;

// ─────────────────────────────────────────────────────────────────────────────
// Credential metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Identity and validity of a loaded client certificate.
///
/// Extracted once when the credential is parsed, so readers never touch DER.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CredentialInfo {
    /// Full subject DN (RFC 4514 string form).
    pub subject: String,

    /// Full issuer DN.
    pub issuer: String,

    /// Certificate Common Name (CN).
    pub common_name: Option<String>,

    /// Serial number, colon-separated hex.
    pub serial: String,

    /// Subject Alternative Name — URI entries.
    pub san_uris: Vec<String>,

    /// Subject Alternative Name — DNS entries.
    pub san_dns_names: Vec<String>,

    /// Start of the validity window.
    pub not_before: Option<DateTime<Utc>>,

    /// End of the validity window.
    pub not_after: Option<DateTime<Utc>>,
}

impl CredentialInfo {
    /// Parse a DER-encoded certificate and extract its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::CertStructure`] if the bytes are not a
    /// well-formed X.509 certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, ParseError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| ParseError::CertStructure(e.to_string()))?;

        let (san_uris, san_dns_names) = extract_sans(&cert);

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            common_name: extract_cn(&cert),
            serial: cert.raw_serial_as_string(),
            san_uris,
            san_dns_names,
            not_before: to_utc(cert.validity().not_before),
            not_after: to_utc(cert.validity().not_after),
        })
    }

    /// `true` when `now` is past the end of the validity window.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after.is_some_and(|end| now > end)
    }

    /// Label for log lines: CN when present, the subject DN otherwise.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.common_name.as_deref().unwrap_or(&self.subject)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the CN attribute from the subject DN.
fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// Extract SAN URI and SAN DNS entries from the certificate extensions.
fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<String>) {
    let mut uris = Vec::new();
    let mut dns_names = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::URI(uri) => uris.push((*uri).to_owned()),
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                _ => {}
            }
        }
    }

    (uris, dns_names)
}

fn to_utc(time: ASN1Time) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::string::Ia5String;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

    // ── helpers ──────────────────────────────────────────────────────────────

    /// Generate a self-signed DER cert with the given CN and SANs.
    fn make_cert_der(cn: &str, sans: &[SanType]) -> Vec<u8> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        dn.push(DnType::OrganizationName, "Example Org");
        params.distinguished_name = dn;
        params.subject_alt_names = sans.to_vec();

        let key_pair = KeyPair::generate().expect("key generation failed");
        let cert = params
            .self_signed(&key_pair)
            .expect("rcgen cert generation failed");
        cert.der().to_vec()
    }

    fn dns_san(s: &str) -> SanType {
        SanType::DnsName(Ia5String::try_from(s).unwrap())
    }

    fn uri_san(s: &str) -> SanType {
        SanType::URI(Ia5String::try_from(s).unwrap())
    }

    // ── from_der ──────────────────────────────────────────────────────────────

    #[test]
    fn from_der_extracts_subject_and_common_name() {
        // GIVEN: cert with CN=ord-aggregator
        let der = make_cert_der("ord-aggregator", &[dns_san("ord.local")]);
        // WHEN
        let info = CredentialInfo::from_der(&der).unwrap();
        // THEN
        assert_eq!(info.common_name.as_deref(), Some("ord-aggregator"));
        assert!(info.subject.contains("CN=ord-aggregator"), "{}", info.subject);
        assert!(info.subject.contains("O=Example Org"), "{}", info.subject);
    }

    #[test]
    fn self_signed_issuer_equals_subject() {
        let der = make_cert_der("self", &[]);
        let info = CredentialInfo::from_der(&der).unwrap();
        assert_eq!(info.issuer, info.subject);
    }

    #[test]
    fn from_der_extracts_sans() {
        let der = make_cert_der(
            "multi-san",
            &[uri_san("spiffe://cluster.local/ns/x"), dns_san("x.internal")],
        );
        let info = CredentialInfo::from_der(&der).unwrap();
        assert_eq!(info.san_uris, vec!["spiffe://cluster.local/ns/x"]);
        assert_eq!(info.san_dns_names, vec!["x.internal"]);
    }

    #[test]
    fn from_der_extracts_validity_window() {
        let der = make_cert_der("valid", &[]);
        let info = CredentialInfo::from_der(&der).unwrap();
        let (start, end) = (info.not_before.unwrap(), info.not_after.unwrap());
        assert!(start < end);
        assert!(!info.is_expired_at(start));
        assert!(info.is_expired_at(end + chrono::Duration::seconds(1)));
    }

    #[test]
    fn from_der_invalid_bytes_returns_structure_error() {
        let result = CredentialInfo::from_der(b"not a cert");
        assert!(matches!(result, Err(ParseError::CertStructure(_))));
    }

    // ── display_name ──────────────────────────────────────────────────────────

    #[test]
    fn display_name_prefers_common_name() {
        let der = make_cert_der("named", &[]);
        let info = CredentialInfo::from_der(&der).unwrap();
        assert_eq!(info.display_name(), "named");
    }

    #[test]
    fn display_name_falls_back_to_subject() {
        let info = CredentialInfo {
            subject: "O=Nameless".to_string(),
            ..CredentialInfo::default()
        };
        assert_eq!(info.display_name(), "O=Nameless");
    }
}
