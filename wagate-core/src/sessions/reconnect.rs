use std::time::Duration;

use crate::util::pacing;

/// Reconnection schedule: `max_quick_attempts` exponentially backed-off
/// tries, then one long cool-off before the counter resets. A manual
/// disconnect flag is checked before every attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_quick_attempts: u32,
    pub long_cooloff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            cap: Duration::from_secs(60),
            max_quick_attempts: 20,
            long_cooloff: Duration::from_secs(120),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `n` (1-based): `min(base * 2^(n-1), cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        pacing::reconnect_delay(attempt, self.base, self.cap)
    }
}
