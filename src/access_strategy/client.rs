//! Outbound HTTP client with an explicit, inspectable TLS configuration.
//!
//! `reqwest` does not expose the TLS settings of a built client, so
//! [`HttpClient`] keeps the `rustls::ClientConfig` it was built from next to
//! it.  Deriving a client with a client certificate clones that config,
//! installs a certificate resolver on the clone and builds a fresh
//! `reqwest::Client`; the base client and its config are never touched.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ResolvesClientCert, Resumption};
use rustls::crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::config::HttpClientConfig;
use crate::credential::{CredentialCache, load_certs};
use crate::{Error, Result};

/// A `reqwest::Client` together with the TLS config and timeout it was built with.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    tls: Arc<ClientConfig>,
    timeout: Duration,
}

impl HttpClient {
    /// Build a client without a client certificate.
    ///
    /// Trusts the Mozilla root set plus `ca_bundle`, or nothing at all when
    /// `insecure_skip_verify` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA bundle cannot be loaded or the client
    /// cannot be built.
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let tls = if config.insecure_skip_verify {
            warn!("TLS server certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(root_store(config)?)
                .with_no_client_auth()
        };

        Self::from_tls_config(tls, config.timeout)
    }

    /// Build a client around an existing TLS config.
    ///
    /// # Errors
    ///
    /// Returns an error if `reqwest` rejects the configuration.
    pub fn from_tls_config(mut tls: ClientConfig, timeout: Duration) -> Result<Self> {
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];
        let inner = reqwest::Client::builder()
            .use_preconfigured_tls(tls.clone())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            inner,
            tls: Arc::new(tls),
            timeout,
        })
    }

    /// Derive a client that presents `identity` on every handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the derived client cannot be built.
    pub fn with_client_identity(&self, identity: Arc<CertifiedKey>) -> Result<Self> {
        // Session tickets are bound to the identity that earned them.
        self.derive(Arc::new(StaticIdentity(identity)), Resumption::default())
    }

    /// Derive a client that looks the credential up in `cache` on every
    /// handshake, so rotations apply without rebuilding the client.
    ///
    /// When the cache holds nothing for `name` the handshake proceeds without
    /// a client certificate. Sessions are never resumed, since a resumed
    /// session keeps the identity of the handshake that created it.
    ///
    /// # Errors
    ///
    /// Returns an error if the derived client cannot be built.
    pub fn hot_reloading(
        base: &Self,
        cache: Arc<CredentialCache>,
        name: impl Into<String>,
    ) -> Result<Self> {
        base.derive(
            Arc::new(CachedIdentity {
                cache,
                name: name.into(),
            }),
            Resumption::disabled(),
        )
    }

    fn derive(
        &self,
        resolver: Arc<dyn ResolvesClientCert>,
        resumption: Resumption,
    ) -> Result<Self> {
        let mut tls = ClientConfig::clone(&self.tls);
        tls.client_auth_cert_resolver = resolver;
        tls.resumption = resumption;
        Self::from_tls_config(tls, self.timeout)
    }

    /// The underlying `reqwest` client.
    #[must_use]
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    /// TLS config this client was built from.
    #[must_use]
    pub fn tls_config(&self) -> &Arc<ClientConfig> {
        &self.tls
    }

    /// Whole-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("timeout", &self.timeout)
            .field(
                "client_cert",
                &self.tls.client_auth_cert_resolver.has_certs(),
            )
            .finish_non_exhaustive()
    }
}

fn root_store(config: &HttpClientConfig) -> Result<RootCertStore> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    if let Some(bundle) = &config.ca_bundle {
        let path = bundle.to_string_lossy();
        let certs = load_certs(&path)?;
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(Error::Config(format!(
                "CA bundle {path} contains no usable certificates"
            )));
        }
        debug!(ca_bundle = %path, added, ignored, "Loaded extra trust anchors");
    }

    Ok(roots)
}

/// Always presents the same certificate.
#[derive(Debug)]
struct StaticIdentity(Arc<CertifiedKey>);

impl ResolvesClientCert for StaticIdentity {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Presents whatever the cache holds for `name` at handshake time.
#[derive(Debug)]
struct CachedIdentity {
    cache: Arc<CredentialCache>,
    name: String,
}

impl ResolvesClientCert for CachedIdentity {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        match self.cache.get(&self.name) {
            Ok(credential) => Some(credential.certified_key()),
            Err(e) => {
                debug!(secret = %self.name, error = %e, "No client certificate for handshake");
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
