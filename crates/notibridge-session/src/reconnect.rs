//! Reconnect backoff policy.

use std::time::Duration;

use notibridge_core::config::ReconnectConfig;

/// Doubling backoff between reconnect attempts of one device session.
///
/// The delay before retry `n` (0-based) is `initial_delay * 2^n`, capped at
/// `max_delay`: 3s, 6s, 12s, 24s, 30s, 30s... with the shipped settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// `reconnect.baseDelayMs`.
    pub initial_delay: Duration,
    /// `reconnect.maxDelayMs`.
    pub max_delay: Duration,
    /// `reconnect.maxAttempts`. Once this many retries have failed the
    /// session is `Failed`; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after `attempt` consecutive failures.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether a session that has used `attempt` retries may try again.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}
