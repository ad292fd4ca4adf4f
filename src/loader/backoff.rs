//! Delay between watch attempts.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

use crate::config::{ReconnectConfig, ReconnectStrategy};

/// Produces the sleep before each reconnect.
///
/// `Fixed` always yields the configured interval. `Exponential` starts at the
/// interval, doubles up to `max_interval` and adds jitter so that many loaders
/// losing the same feed do not reconnect in lockstep.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    delays: Option<ExponentialBackoff>,
}

impl ReconnectPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            config: config.clone(),
            delays: None,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        match self.config.strategy {
            ReconnectStrategy::Fixed => self.config.interval,
            ReconnectStrategy::Exponential => {
                let config = &self.config;
                self.delays
                    .get_or_insert_with(|| {
                        ExponentialBuilder::default()
                            .with_min_delay(config.interval)
                            .with_max_delay(config.max_interval)
                            .with_factor(2.0)
                            .with_jitter()
                            .without_max_times()
                            .build()
                    })
                    .next()
                    .unwrap_or(config.max_interval)
            }
        }
    }

    /// Start over from the initial interval.
    pub fn reset(&mut self) {
        self.delays = None;
    }
}
