//! Access strategy executors against an in-process HTTP server.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::get;
use certloader::Error;
use certloader::access_strategy::{
    AccessStrategies, AccessStrategy, AccessStrategyType, Executor, ExecutorRegistry, HttpClient,
    MtlsExecutor, OpenExecutor, RequestTenant, StaticTenant,
};
use certloader::config::HttpClientConfig;
use certloader::credential::CredentialCache;
use certloader::error::CacheError;
use certloader::feed::SecretFields;
use pretty_assertions::assert_eq;

async fn echo_tenant(headers: HeaderMap) -> String {
    headers
        .get("Tenant")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none")
        .to_string()
}

async fn document_server() -> String {
    let router = Router::new()
        .route("/doc", get(|| async { "document body" }))
        .route("/tenant", get(echo_tenant));
    format!("http://{}", common::serve(router).await)
}

fn base_client() -> HttpClient {
    HttpClient::new(&HttpClientConfig::default()).unwrap()
}

#[tokio::test]
async fn open_executor_fetches_with_base_client() {
    let base = document_server().await;

    let response = OpenExecutor
        .execute(&base_client(), &format!("{base}/doc"))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "document body");
}

#[tokio::test]
async fn mtls_executions_never_touch_shared_base_client() {
    // GIVEN: one shared base client and two credentials
    let base_url = document_server().await;
    let client = base_client();
    let base_tls = Arc::clone(client.tls_config());
    let cache = Arc::new(CredentialCache::new());
    cache
        .put_payload("first", &common::payload("first"), &SecretFields::default())
        .unwrap();
    cache
        .put_payload("second", &common::payload("second"), &SecretFields::default())
        .unwrap();
    let first = MtlsExecutor::new(Arc::clone(&cache), "first");
    let second = MtlsExecutor::new(Arc::clone(&cache), "second");

    // WHEN / THEN: after each execution the base transport is unchanged
    for executor in [&first, &second] {
        let response = executor
            .execute(&client, &format!("{base_url}/doc"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(Arc::ptr_eq(client.tls_config(), &base_tls));
        assert!(!client.tls_config().client_auth_cert_resolver.has_certs());
    }

    // AND: the base client still works for open fetches
    let response = OpenExecutor
        .execute(&client, &format!("{base_url}/doc"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn mtls_executor_without_credential_does_not_send() {
    let base_url = document_server().await;
    let executor = MtlsExecutor::new(Arc::new(CredentialCache::new()), "missing");

    let err = executor
        .execute(&base_client(), &format!("{base_url}/doc"))
        .await
        .unwrap_err();

    assert!(err.is_credential_unavailable());
    assert!(matches!(err, Error::Credential(CacheError::NotFound(_))));
}

#[tokio::test]
async fn mtls_executor_sends_tenant_header() {
    let base_url = document_server().await;
    let cache = Arc::new(CredentialCache::new());
    cache
        .put_payload("ext", &common::payload("ext"), &SecretFields::default())
        .unwrap();

    let with_tenant = MtlsExecutor::new(Arc::clone(&cache), "ext")
        .with_tenant("Tenant", Arc::new(StaticTenant("tenant-a".to_string())));
    let without_tenant = MtlsExecutor::new(cache, "ext");

    let url = format!("{base_url}/tenant");
    let tagged = with_tenant.execute(&base_client(), &url).await.unwrap();
    let untagged = without_tenant.execute(&base_client(), &url).await.unwrap();

    assert_eq!(tagged.text().await.unwrap(), "tenant-a");
    assert_eq!(untagged.text().await.unwrap(), "none");
}

#[tokio::test]
async fn shared_executor_sends_each_request_its_own_tenant() {
    // GIVEN: one executor reading the tenant from the request scope
    let base_url = document_server().await;
    let cache = Arc::new(CredentialCache::new());
    cache
        .put_payload("ext", &common::payload("ext"), &SecretFields::default())
        .unwrap();
    let executor = MtlsExecutor::new(cache, "ext").with_tenant("Tenant", Arc::new(RequestTenant));
    let client = base_client();
    let url = format!("{base_url}/tenant");

    // WHEN: requests run under different tenants, and one outside any scope
    let (a, b) = tokio::join!(
        RequestTenant::scope("tenant-a", executor.execute(&client, &url)),
        RequestTenant::scope("tenant-b", executor.execute(&client, &url)),
    );
    let unscoped = executor.execute(&client, &url).await.unwrap();

    // THEN
    assert_eq!(a.unwrap().text().await.unwrap(), "tenant-a");
    assert_eq!(b.unwrap().text().await.unwrap(), "tenant-b");
    assert_eq!(unscoped.text().await.unwrap(), "none");
}

#[tokio::test]
async fn registry_dispatch_follows_document_preference() {
    // GIVEN: a document preferring an unknown custom scheme, then open
    let base_url = document_server().await;
    let registry = ExecutorRegistry::builder()
        .register("open", Arc::new(OpenExecutor))
        .build();
    let strategies = AccessStrategies(vec![
        AccessStrategy::custom("unsupported-x", None),
        AccessStrategy::new("open"),
    ]);

    // WHEN
    let chosen = strategies.get_supported(&registry).unwrap();
    let executor = registry.provide(&chosen).unwrap();
    let response = executor
        .execute(&base_client(), &format!("{base_url}/doc"))
        .await
        .unwrap();

    // THEN
    assert_eq!(chosen, AccessStrategyType::open());
    assert_eq!(response.text().await.unwrap(), "document body");
    assert!(
        registry
            .provide(&AccessStrategyType::new("unsupported-x"))
            .err()
            .unwrap()
            .is_unsupported()
    );
}
