//! certloader
//!
//! Keeps mutual-TLS client credentials loaded from a secret store and swaps
//! them in place when the secret rotates, without restarting the process.
//!
//! # Features
//!
//! - **Change feeds**: mounted secret directories, or the Kubernetes API
//!   (feature `kubernetes`), behind one [`feed::ChangeFeed`] trait
//! - **Loaders**: one watch-and-reconnect task per secret, isolated from each other
//! - **Cache**: name-keyed, atomically replaced, stale-but-available over empty
//! - **Readiness gate**: block startup until a credential is loaded
//! - **Access strategies**: pick the first supported strategy a document
//!   declares and fetch it openly or over mTLS

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access_strategy;
pub mod cli;
pub mod config;
pub mod credential;
pub mod error;
pub mod feed;
pub mod loader;
pub mod service;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
