//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::Router;
use certloader::credential::CredentialCache;
use certloader::feed::RawSecretPayload;

/// Self-signed certificate and key PEM with the given common name.
pub fn pem_pair(cn: &str) -> (String, String) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![format!("{cn}.test")]).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, cn);
    let cert = params.self_signed(&key_pair).unwrap();
    (cert.pem(), key_pair.serialize_pem())
}

/// Payload with the default `tls.crt` / `tls.key` fields.
pub fn payload(cn: &str) -> RawSecretPayload {
    let (cert, key) = pem_pair(cn);
    payload_of(&cert, &key)
}

/// Payload carrying the given PEM pair under `tls.crt` / `tls.key`.
pub fn payload_of(cert: &str, key: &str) -> RawSecretPayload {
    let mut data = HashMap::new();
    data.insert("tls.crt".to_string(), cert.as_bytes().to_vec());
    data.insert("tls.key".to_string(), key.as_bytes().to_vec());
    RawSecretPayload::new(data)
}

/// Write a mounted-secret directory.
pub fn write_secret(dir: &Path, cn: &str) {
    let (cert, key) = pem_pair(cn);
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("tls.crt"), cert).unwrap();
    std::fs::write(dir.join("tls.key"), key).unwrap();
}

/// Common name currently cached under `name`.
pub fn cached_cn(cache: &CredentialCache, name: &str) -> Option<String> {
    cache
        .get(name)
        .ok()
        .and_then(|c| c.info().common_name.clone())
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

/// Serve `router` on an ephemeral local port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
