//! Backoff policy for failed deliveries.

use std::time::Duration;

use crate::config::OutboundConfig;

/// Retry bounds and delays for the outbound worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Rate-limited messages are requeued at most this many times.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Delay before the single retry after a server error.
    pub server_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OutboundConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &OutboundConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            server_retry_delay: Duration::from_millis(config.server_retry_delay_ms),
        }
    }

    /// `initial_delay * multiplier^(retry_count - 1)`, capped at `max_delay`. `retry_count` starts at 1.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        Duration::from_millis(ms.min(cap).max(0.0) as u64)
    }
}
