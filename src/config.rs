//! Configuration management

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::access_strategy::AccessStrategyType;
use crate::feed::SecretFields;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Secrets to watch and how to reconnect
    pub credentials: CredentialsConfig,
    /// Startup gate
    pub readiness: ReadinessConfig,
    /// Where secrets come from
    pub feed: FeedConfig,
    /// Outbound HTTP client
    pub http: HttpClientConfig,
    /// Access strategy → credential wiring
    pub access_strategies: AccessStrategyConfig,
}

/// Secrets to keep loaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// One loader per entry
    pub secrets: Vec<SecretConfig>,
    /// Reconnect behaviour shared by all loaders
    pub reconnect: ReconnectConfig,
}

/// A single watched secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretConfig {
    /// Secret name, `namespace/name` or bare `name`
    pub name: String,
    /// Field holding the PEM certificate chain
    #[serde(default = "default_cert_field")]
    pub cert_field: String,
    /// Field holding the PEM private key
    #[serde(default = "default_key_field")]
    pub key_field: String,
}

fn default_cert_field() -> String {
    SecretFields::default().cert_field
}

fn default_key_field() -> String {
    SecretFields::default().key_field
}

impl SecretConfig {
    /// Secret with the default `tls.crt` / `tls.key` layout.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cert_field: default_cert_field(),
            key_field: default_key_field(),
        }
    }

    /// Field names as used by the parser.
    #[must_use]
    pub fn fields(&self) -> SecretFields {
        SecretFields {
            cert_field: self.cert_field.clone(),
            key_field: self.key_field.clone(),
        }
    }
}

/// How the delay between watch attempts evolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    /// Always wait `interval`
    #[default]
    Fixed,
    /// Start at `interval`, double up to `max_interval`, with jitter
    Exponential,
}

/// Watch reconnect configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay policy
    pub strategy: ReconnectStrategy,
    /// Fixed delay, or first delay for exponential
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Upper bound for exponential delays
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::Fixed,
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(120),
        }
    }
}

/// Readiness gate configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// How often the cache is checked
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long to wait before giving up
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Change feed implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedBackend {
    /// Mounted secret directories
    #[default]
    File,
    /// Kubernetes API watch (requires the `kubernetes` feature)
    Kubernetes,
}

/// Change feed configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Backend to use
    pub backend: FeedBackend,
    /// Root directory for the file backend
    pub directory: PathBuf,
    /// Namespace for bare secret names
    pub namespace: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            backend: FeedBackend::File,
            directory: PathBuf::from("/etc/certloader/secrets"),
            namespace: "default".to_string(),
        }
    }
}

/// Outbound HTTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Whole-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra trusted roots (PEM file)
    pub ca_bundle: Option<PathBuf>,
    /// Skip server certificate verification
    pub insecure_skip_verify: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            ca_bundle: None,
            insecure_skip_verify: false,
        }
    }
}

/// Maps an mTLS access strategy type to the credential it presents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtlsStrategyConfig {
    /// Access strategy type identifier
    #[serde(rename = "type")]
    pub strategy_type: String,
    /// Configured secret name
    pub credential: String,
}

/// Access strategy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessStrategyConfig {
    /// mTLS strategies; empty means `sap:cmp-mtls:v1` → first secret
    pub mtls: Vec<MtlsStrategyConfig>,
    /// Header carrying the tenant id on mTLS requests
    pub tenant_header: String,
}

impl Default for AccessStrategyConfig {
    fn default() -> Self {
        Self {
            mtls: Vec::new(),
            tenant_header: "Tenant".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // CERTLOADER_ prefix, __ for nesting (CERTLOADER_HTTP__TIMEOUT=10s)
        figment = figment.merge(Env::prefixed("CERTLOADER_").split("__"));

        // env_files may set CERTLOADER_* variables; Env is read lazily on extract.
        let env_files: Vec<String> = figment.extract_inner("env_files").unwrap_or_default();
        load_env_files(&env_files);

        let config = Self::from_figment(&figment)?;
        config.validate()?;
        Ok(config)
    }

    fn from_figment(figment: &Figment) -> Result<Self> {
        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let secrets = &self.credentials.secrets;
        if secrets.is_empty() {
            return Err(Error::Config(
                "credentials.secrets must name at least one secret".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for secret in secrets {
            if secret.name.trim().is_empty() {
                return Err(Error::Config("secret name must not be empty".to_string()));
            }
            if !seen.insert(secret.name.as_str()) {
                return Err(Error::Config(format!(
                    "secret '{}' is configured twice",
                    secret.name
                )));
            }
        }

        let durations = [
            ("credentials.reconnect.interval", self.credentials.reconnect.interval),
            ("credentials.reconnect.max_interval", self.credentials.reconnect.max_interval),
            ("readiness.poll_interval", self.readiness.poll_interval),
            ("readiness.timeout", self.readiness.timeout),
            ("http.timeout", self.http.timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        for strategy in &self.access_strategies.mtls {
            if !seen.contains(strategy.credential.as_str()) {
                return Err(Error::Config(format!(
                    "access strategy '{}' uses unknown credential '{}'",
                    strategy.strategy_type, strategy.credential
                )));
            }
        }

        Ok(())
    }

    /// mTLS strategy types and the secret each presents, defaults applied.
    #[must_use]
    pub fn mtls_strategies(&self) -> Vec<(AccessStrategyType, String)> {
        if !self.access_strategies.mtls.is_empty() {
            return self
                .access_strategies
                .mtls
                .iter()
                .map(|s| (AccessStrategyType::new(&s.strategy_type), s.credential.clone()))
                .collect();
        }
        self.credentials
            .secrets
            .first()
            .map(|s| vec![(AccessStrategyType::cmp_mtls_v1(), s.name.clone())])
            .unwrap_or_default()
    }
}

/// Load environment files into the process environment.
/// Supports ~ expansion. Files that don't exist are silently skipped.
fn load_env_files(paths: &[String]) {
    for path_str in paths {
        let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
            (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
            _ => path_str.clone(),
        };

        let path = Path::new(&expanded);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        } else {
            tracing::debug!("Env file not found (skipped): {expanded}");
        }
    }
}

/// Human-readable durations: `"500ms"`, `"30s"`, `"5m"`, `"1h"`, or bare seconds.
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(s.trim()).map_err(serde::de::Error::custom),
        }
    }

    /// YAML `timeout: 10` and `CERTLOADER_..._TIMEOUT=10` arrive as integers.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        // "ms" before "s" and "m"
        let (digits, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
            return number(ms).map(Duration::from_millis);
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        let secs = number(digits)?
            .checked_mul(unit_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))?;
        Ok(Duration::from_secs(secs))
    }

    fn number(s: &str) -> Result<u64, String> {
        s.trim()
            .parse()
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    }
}
