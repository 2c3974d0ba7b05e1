//! Reconnection scheduling
//!
//! Exponential backoff between automatic reconnect attempts:
//! `delay = min(base_delay * 2^attempt, max_delay)`. After `max_attempts` armed
//! retries the scheduler halts until the caller reconnects manually or the
//! network comes back online.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap applied after doubling
    pub max_delay: Duration,
    /// Automatic retries before the scheduler halts
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            max_attempts: 5,
        }
    }
}

/// Result of asking the scheduler for the next retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry `attempt` (1-based) after `delay`
    Retry { attempt: u32, delay: Duration },
    /// All automatic retries are used up
    Exhausted { attempts: u32 },
}

/// Backoff state for one client
#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Retries armed since the last successful open
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// Delay for the retry following `attempt` previous retries
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(multiplier)
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }

    /// Arm the next retry, bumping the attempt counter
    pub fn next_retry(&mut self) -> RetryDecision {
        if self.is_exhausted() {
            tracing::warn!(
                attempts = self.attempt,
                max_attempts = self.config.max_attempts,
                "Reconnect attempts exhausted - waiting for manual retry"
            );
            return RetryDecision::Exhausted {
                attempts: self.attempt,
            };
        }

        let delay = self.delay_for(self.attempt);
        self.attempt += 1;

        tracing::debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect armed"
        );

        RetryDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// Count a retry that bypasses backoff (first connect timeout)
    pub fn record_immediate_retry(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// Forget all previous failures
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            tracing::debug!(previous_attempts = self.attempt, "Reconnect counter reset");
        }
        self.attempt = 0;
    }
}

impl Default for ReconnectScheduler {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
