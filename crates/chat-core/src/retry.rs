use std::time::Duration;

/// Exponential backoff used by the transport's reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    ///
    /// A server hint wins when it is longer than the computed backoff; the
    /// result never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let multiplier = 1_u32 << attempt.min(16);
        let computed = self.base_delay.saturating_mul(multiplier);
        computed
            .max(hint.unwrap_or_default())
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_waits_base_delay() {
        let policy = ReconnectPolicy::new(Duration::from_millis(250), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(0, None), Duration::from_millis(250));
    }

    #[test]
    fn doubles_per_attempt_until_cap() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3, None), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(40, None), Duration::from_secs(1));
    }

    #[test]
    fn honors_longer_server_hint() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.delay_for_attempt(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn max_is_never_below_base() {
        let policy = ReconnectPolicy::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(policy.max_delay(), Duration::from_secs(2));
    }
}
