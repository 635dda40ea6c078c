use std::time::Duration;

pub const BASE_DELAY: Duration = Duration::from_millis(1000);
pub const MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const MAX_ATTEMPTS: u32 = 5;

/// Where the connection driver currently stands. `Backoff` carries the
/// attempt about to be made so an operator surface can show "retry 3/5".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Backoff {
        attempt: u32,
    },
    GivingUp,
}

/// Exponential backoff schedule for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after the `failures`-th consecutive failure, or `None`
    /// once the attempt budget is spent and the driver should give up.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_attempts {
            return None;
        }
        let doublings = failures - 1;
        let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}
