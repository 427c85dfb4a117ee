//! Retry policy for failed dispatch loops.
//!
//! Two independent budgets:
//! - rate limits: wait what the provider asks plus a margin, unlimited times;
//! - generic failures: `max_retries` retries with `base * 2^attempt` backoff.
//!
//! Authorization failures are never retried automatically.

use courier_core::config::DispatchConfig;
use courier_core::error::DispatchFailure;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub flood_margin: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// What to do with a message after a failed loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Provider rate limit; does not touch the retry budget.
    Wait(Duration),
    /// Generic retry `attempt` (0-based) after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Generic budget used up.
    Exhausted,
    /// Not retryable without operator action.
    Terminal,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            flood_margin: Duration::from_secs(config.flood_wait_margin_secs),
        }
    }

    /// `base * 2^attempt`, saturating.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }

    pub fn flood_delay(&self, seconds: u64) -> Duration {
        Duration::from_secs(seconds).saturating_add(self.flood_margin)
    }

    /// Decide the follow-up for `failure`, given the retries already consumed.
    pub fn decide(&self, failure: &DispatchFailure, retry_count: u32) -> RetryDecision {
        match failure {
            DispatchFailure::RateLimited { seconds } => RetryDecision::Wait(self.flood_delay(*seconds)),
            DispatchFailure::AuthorizationFailed(_) => RetryDecision::Terminal,
            DispatchFailure::LoopFailed(_) if retry_count < self.max_retries => RetryDecision::Retry {
                attempt: retry_count,
                delay: self.backoff_delay(retry_count),
            },
            DispatchFailure::LoopFailed(_) => RetryDecision::Exhausted,
        }
    }
}
