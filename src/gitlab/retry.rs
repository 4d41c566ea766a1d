use std::time::Duration;

pub const DEFAULT_RATE_LIMIT_ATTEMPTS: u32 = 5;
pub const DEFAULT_NETWORK_ATTEMPTS: u32 = 3;

/// Retry budget for one page request.
///
/// Rate-limit responses back off exponentially from `base_delay`, or wait the
/// server's `Retry-After` when one was sent. Transient network failures back
/// off linearly. Every wait is capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub rate_limit_attempts: u32,
    pub network_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_attempts: DEFAULT_RATE_LIMIT_ATTEMPTS,
            network_attempts: DEFAULT_NETWORK_ATTEMPTS,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waits, for tests.
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (1-based) after a rate-limit response.
    pub fn rate_limit_delay(&self, attempt: u32, server_hint: Option<Duration>) -> Duration {
        let delay = server_hint.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        delay.min(self.max_delay)
    }

    /// Wait before retry number `attempt` (1-based) after a transient failure.
    pub fn network_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}
