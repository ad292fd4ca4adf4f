//! Executors perform one GET according to an access strategy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::client::HttpClient;
use crate::credential::CredentialCache;
use crate::{Error, Result};

/// Performs a document fetch for one access strategy type.
#[async_trait]
pub trait Executor: Send + Sync {
    /// GET `url` through (a client derived from) `client`.
    ///
    /// The response is returned whatever its status; only transport and
    /// credential failures are errors.
    async fn execute(&self, client: &HttpClient, url: &str) -> Result<reqwest::Response>;
}

/// Supplies the tenant on whose behalf a request is made.
///
/// Called once per request, on the task performing it.
pub trait TenantProvider: Send + Sync {
    /// Current tenant id, if any.
    fn tenant(&self) -> Option<String>;
}

tokio::task_local! {
    static REQUEST_TENANT: String;
}

/// The tenant of the request being served, set with [`RequestTenant::scope`].
///
/// One executor built with this provider can be shared across requests for
/// different tenants:
///
/// ```no_run
/// # async fn demo(executor: &dyn certloader::access_strategy::Executor,
/// #               client: &certloader::access_strategy::HttpClient) -> certloader::Result<()> {
/// use certloader::access_strategy::RequestTenant;
///
/// let _response = RequestTenant::scope("tenant-a", executor.execute(client, "https://docs/api")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTenant;

impl RequestTenant {
    /// Run `fut` with `tenant` as the request tenant.
    pub async fn scope<F: Future>(tenant: impl Into<String>, fut: F) -> F::Output {
        REQUEST_TENANT.scope(tenant.into(), fut).await
    }
}

impl TenantProvider for RequestTenant {
    fn tenant(&self) -> Option<String> {
        REQUEST_TENANT.try_with(Clone::clone).ok()
    }
}

/// A tenant fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticTenant(pub String);

impl TenantProvider for StaticTenant {
    fn tenant(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|source| Error::InvalidUrl {
        url: url.to_string(),
        source,
    })
}

/// Unauthenticated GET with the caller's client as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenExecutor;

#[async_trait]
impl Executor for OpenExecutor {
    async fn execute(&self, client: &HttpClient, url: &str) -> Result<reqwest::Response> {
        let url = parse_url(url)?;
        debug!(url = %url, "Fetching without client certificate");
        Ok(client.inner().get(url).send().await?)
    }
}

/// GET presenting the cached client certificate for `credential`.
pub struct MtlsExecutor {
    cache: Arc<CredentialCache>,
    credential: String,
    tenant: Option<(String, Arc<dyn TenantProvider>)>,
}

impl MtlsExecutor {
    /// Executor presenting the credential cached under `credential`.
    #[must_use]
    pub fn new(cache: Arc<CredentialCache>, credential: impl Into<String>) -> Self {
        Self {
            cache,
            credential: credential.into(),
            tenant: None,
        }
    }

    /// Also send the provider's tenant id in `header`.
    #[must_use]
    pub fn with_tenant(mut self, header: impl Into<String>, provider: Arc<dyn TenantProvider>) -> Self {
        self.tenant = Some((header.into(), provider));
        self
    }

    /// Name of the credential this executor presents.
    #[must_use]
    pub fn credential(&self) -> &str {
        &self.credential
    }
}

impl std::fmt::Debug for MtlsExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsExecutor")
            .field("credential", &self.credential)
            .field("tenant_header", &self.tenant.as_ref().map(|(h, _)| h))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Executor for MtlsExecutor {
    async fn execute(&self, client: &HttpClient, url: &str) -> Result<reqwest::Response> {
        let url = parse_url(url)?;
        // No certificate, no request.
        let credential = self.cache.get(&self.credential)?;
        let derived = client.with_client_identity(credential.certified_key())?;

        let mut request = derived.inner().get(url.clone());
        if let Some((header, provider)) = &self.tenant
            && let Some(tenant) = provider.tenant()
        {
            request = request.header(header.as_str(), tenant);
        }

        debug!(
            url = %url,
            credential = %self.credential,
            subject = %credential.info().display_name(),
            "Fetching with client certificate"
        );
        Ok(request.send().await?)
    }
}
