use std::time::Duration;

/// Capped exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay after the `attempt`-th consecutive failure (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2_u32.saturating_pow(exponent);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// First `n` delays of the schedule
    pub fn schedule(&self, n: u32) -> Vec<Duration> {
        (1..=n).map(|attempt| self.delay(attempt)).collect()
    }
}
