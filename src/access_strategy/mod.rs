//! Access strategies: how an external document must be fetched.
//!
//! A document declares an ordered list of [`AccessStrategy`] entries. The
//! [`ExecutorRegistry`] knows which types this process can perform;
//! [`AccessStrategies::get_supported`] picks the first declared type it can,
//! and [`ExecutorRegistry::provide`] hands out the matching [`Executor`].

pub mod client;
pub mod executor;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use client::HttpClient;
pub use executor::{
    Executor, MtlsExecutor, OpenExecutor, RequestTenant, StaticTenant, TenantProvider,
};

use crate::config::Config;
use crate::credential::CredentialCache;
use crate::{Error, Result};

/// Access strategy type identifier, e.g. `open` or `sap:cmp-mtls:v1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessStrategyType(String);

impl AccessStrategyType {
    /// Unauthenticated fetch.
    pub const OPEN: &'static str = "open";
    /// Fetch presenting the configured client certificate.
    pub const CMP_MTLS_V1: &'static str = "sap:cmp-mtls:v1";
    /// Placeholder; the real type is in `customType`.
    pub const CUSTOM: &'static str = "custom";

    /// Wrap an arbitrary identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The `open` type.
    #[must_use]
    pub fn open() -> Self {
        Self::new(Self::OPEN)
    }

    /// The `sap:cmp-mtls:v1` type.
    #[must_use]
    pub fn cmp_mtls_v1() -> Self {
        Self::new(Self::CMP_MTLS_V1)
    }

    /// String form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` for the `custom` placeholder.
    #[must_use]
    pub fn is_custom(&self) -> bool {
        self.0 == Self::CUSTOM
    }

    /// `true` iff `registry` has an executor for this type.
    #[must_use]
    pub fn is_supported(&self, registry: &ExecutorRegistry) -> bool {
        registry.executors.contains_key(self)
    }
}

impl fmt::Display for AccessStrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccessStrategyType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One declared way to fetch a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessStrategy {
    /// Strategy type
    #[serde(rename = "type")]
    pub strategy_type: AccessStrategyType,
    /// Actual type when `type` is `custom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_type: Option<AccessStrategyType>,
    /// Free-text description of a custom strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_description: Option<String>,
}

impl AccessStrategy {
    /// A non-custom strategy.
    #[must_use]
    pub fn new(strategy_type: impl Into<AccessStrategyType>) -> Self {
        Self {
            strategy_type: strategy_type.into(),
            custom_type: None,
            custom_description: None,
        }
    }

    /// A `custom` strategy whose real type is `custom_type`.
    #[must_use]
    pub fn custom(custom_type: impl Into<AccessStrategyType>, description: Option<String>) -> Self {
        Self {
            strategy_type: AccessStrategyType::new(AccessStrategyType::CUSTOM),
            custom_type: Some(custom_type.into()),
            custom_description: description,
        }
    }

    /// The type that has to be supported for this entry to be usable.
    fn effective_type(&self) -> Option<&AccessStrategyType> {
        if self.strategy_type.is_custom() {
            self.custom_type.as_ref()
        } else {
            Some(&self.strategy_type)
        }
    }
}

/// A document's strategies in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessStrategies(pub Vec<AccessStrategy>);

impl AccessStrategies {
    /// First supported type in declaration order.
    ///
    /// Custom entries are matched on their `customType`; a custom entry
    /// without one is skipped. Order is the producer's preference, so an
    /// earlier unsupported entry never hides a later supported one and a
    /// later supported entry never beats an earlier one.
    #[must_use]
    pub fn get_supported(&self, registry: &ExecutorRegistry) -> Option<AccessStrategyType> {
        self.0
            .iter()
            .filter_map(AccessStrategy::effective_type)
            .find(|ty| ty.is_supported(registry))
            .cloned()
    }
}

impl From<Vec<AccessStrategy>> for AccessStrategies {
    fn from(value: Vec<AccessStrategy>) -> Self {
        Self(value)
    }
}

/// Strategy type → executor, fixed once built.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<AccessStrategyType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Start an empty registry.
    #[must_use]
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::default()
    }

    /// Registry for `config`: `open` plus one mTLS executor per configured
    /// mTLS strategy.
    #[must_use]
    pub fn from_config(
        config: &Config,
        cache: &Arc<CredentialCache>,
        tenant: Option<Arc<dyn TenantProvider>>,
    ) -> Self {
        let mut builder = Self::builder().register(AccessStrategyType::open(), Arc::new(OpenExecutor));
        for (strategy_type, credential) in config.mtls_strategies() {
            let mut executor = MtlsExecutor::new(Arc::clone(cache), credential);
            if let Some(provider) = &tenant {
                executor = executor.with_tenant(
                    config.access_strategies.tenant_header.clone(),
                    Arc::clone(provider),
                );
            }
            builder = builder.register(strategy_type, Arc::new(executor));
        }
        builder.build()
    }

    /// Executor for `strategy_type`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedAccessStrategy`] if nothing is registered for it.
    pub fn provide(&self, strategy_type: &AccessStrategyType) -> Result<Arc<dyn Executor>> {
        self.executors
            .get(strategy_type)
            .cloned()
            .ok_or_else(|| Error::UnsupportedAccessStrategy(strategy_type.to_string()))
    }

    /// Registered types, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<&AccessStrategyType> {
        let mut types: Vec<_> = self.executors.keys().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Collects registrations before the registry is frozen.
#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    executors: HashMap<AccessStrategyType, Arc<dyn Executor>>,
}

impl ExecutorRegistryBuilder {
    /// Register `executor` for `strategy_type`, replacing any earlier one.
    #[must_use]
    pub fn register(
        mut self,
        strategy_type: impl Into<AccessStrategyType>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let strategy_type = strategy_type.into();
        debug!(strategy = %strategy_type, "Access strategy executor registered");
        self.executors.insert(strategy_type, executor);
        self
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> ExecutorRegistry {
        ExecutorRegistry {
            executors: self.executors,
        }
    }
}
