//! Wiring: config → change feed → loaders → cache → readiness → executors.

use std::future::Future;
use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::access_strategy::{
    AccessStrategies, AccessStrategyType, ExecutorRegistry, HttpClient, TenantProvider,
};
use crate::config::{Config, FeedBackend, FeedConfig};
use crate::credential::{CredentialCache, CredentialInfo, ReadinessWaiter};
use crate::feed::{ChangeFeed, FileChangeFeed};
use crate::loader::{CredentialLoader, LoaderHandle};
use crate::{Error, Result};

/// A running credential subsystem.
pub struct CredentialService {
    cache: Arc<CredentialCache>,
    registry: ExecutorRegistry,
    client: HttpClient,
    loaders: LoaderHandle,
}

impl CredentialService {
    /// Start loaders for every configured secret and wait until at least one
    /// credential is loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed or HTTP client cannot be built, or
    /// [`Error::Readiness`] if nothing loads in time. Loaders are stopped
    /// before a readiness error is returned.
    pub async fn start(config: &Config, tenant: Option<Arc<dyn TenantProvider>>) -> Result<Self> {
        let feed = build_feed(&config.feed).await?;
        let client = HttpClient::new(&config.http)?;
        let cache = Arc::new(CredentialCache::new());

        let loaders = CredentialLoader::new(feed, Arc::clone(&cache), &config.credentials)
            .start(CancellationToken::new());

        if let Err(e) = ReadinessWaiter::new(&config.readiness).wait(&cache).await {
            error!(timeout = ?config.readiness.timeout, "No credential loaded in time");
            loaders.shutdown().await;
            return Err(e.into());
        }

        let registry = ExecutorRegistry::from_config(config, &cache, tenant);
        info!(strategies = ?registry.types(), "Credential service ready");

        Ok(Self {
            cache,
            registry,
            client,
            loaders,
        })
    }

    /// The shared credential cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    /// The executor registry.
    #[must_use]
    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// The base HTTP client (no client certificate).
    #[must_use]
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Metadata of every loaded credential.
    #[must_use]
    pub fn credentials(&self) -> Vec<(String, CredentialInfo)> {
        self.cache.snapshot()
    }

    /// Fetch `url` with the first strategy in `strategies` this process supports.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedAccessStrategy`] if none is supported, otherwise
    /// whatever the executor returns.
    pub async fn fetch(
        &self,
        strategies: &AccessStrategies,
        url: &str,
    ) -> Result<(AccessStrategyType, reqwest::Response)> {
        let strategy_type = strategies.get_supported(&self.registry).ok_or_else(|| {
            let declared: Vec<String> = strategies
                .0
                .iter()
                .map(|s| s.strategy_type.to_string())
                .collect();
            Error::UnsupportedAccessStrategy(declared.join(", "))
        })?;
        let executor = self.registry.provide(&strategy_type)?;
        let response = executor.execute(&self.client, url).await?;
        Ok((strategy_type, response))
    }

    /// Keep credentials hot until `shutdown` resolves, then stop the loaders.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        shutdown.await;
        self.shutdown().await;
    }

    /// Stop every loader and wait for them.
    pub async fn shutdown(self) {
        info!("Stopping credential loaders");
        self.loaders.shutdown().await;
    }
}

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Build the configured change feed.
///
/// # Errors
///
/// [`Error::Config`] if the backend is unavailable in this build, or the
/// Kubernetes client cannot be created.
pub async fn build_feed(config: &FeedConfig) -> Result<Arc<dyn ChangeFeed>> {
    match config.backend {
        FeedBackend::File => {
            info!(directory = %config.directory.display(), "Watching mounted secrets");
            Ok(Arc::new(FileChangeFeed::new(
                config.directory.clone(),
                config.namespace.clone(),
            )))
        }
        #[cfg(feature = "kubernetes")]
        FeedBackend::Kubernetes => {
            let feed = crate::feed::KubeSecretFeed::try_default(config.namespace.clone())
                .await
                .map_err(|e| Error::Config(format!("Kubernetes client: {e}")))?;
            info!(namespace = %config.namespace, "Watching Kubernetes secrets");
            Ok(Arc::new(feed))
        }
        #[cfg(not(feature = "kubernetes"))]
        FeedBackend::Kubernetes => Err(Error::Config(
            "feed.backend 'kubernetes' requires the 'kubernetes' feature".to_string(),
        )),
    }
}
