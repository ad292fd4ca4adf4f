//! Startup gate: block until at least one credential is loaded.

use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info};

use super::cache::CredentialCache;
use crate::config::ReadinessConfig;
use crate::error::ReadinessError;

/// Polls a [`CredentialCache`] until it holds a credential or the deadline passes.
///
/// Runs once per process, so a plain poll is enough.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessWaiter {
    poll_interval: Duration,
    timeout: Duration,
}

impl ReadinessWaiter {
    /// Create a waiter from config.
    #[must_use]
    pub fn new(config: &ReadinessConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            timeout: config.timeout,
        }
    }

    /// Wait for the cache to hold at least one credential.
    ///
    /// # Errors
    ///
    /// [`ReadinessError::Timeout`] if nothing was loaded within the timeout.
    /// Callers treat this as fatal.
    pub async fn wait(&self, cache: &CredentialCache) -> Result<(), ReadinessError> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let poll = async {
            loop {
                ticker.tick().await;
                if cache.is_populated() {
                    return;
                }
                debug!("Credential cache still empty");
            }
        };

        timeout(self.timeout, poll)
            .await
            .map_err(|_| ReadinessError::Timeout(self.timeout))?;
        info!("Credential cache is populated");
        Ok(())
    }
}

impl Default for ReadinessWaiter {
    fn default() -> Self {
        Self::new(&ReadinessConfig::default())
    }
}
