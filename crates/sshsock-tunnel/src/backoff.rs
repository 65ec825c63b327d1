use std::time::Duration;

use sshsock_traits::config::BackoffConfig;

/// Exponential retry schedule for one failure episode.
///
/// Every failure is recorded with [`Backoff::next_delay`]. The first delay is
/// `min` and each following delay doubles, capped at `max`. The failure that
/// brings the count to `max_attempts` exhausts the schedule; `max_attempts == 0`
/// never exhausts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            next: config.min,
            config,
            failures: 0,
        }
    }

    /// Records a failure and returns the wait before the next attempt, or
    /// `None` if that failure used up the last attempt.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if !self.config.is_unbounded() && self.failures >= self.config.max_attempts {
            return None;
        }
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.config.max);
        Some(delay)
    }

    /// Consecutive failures recorded in this episode.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.next = self.config.min;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_default_schedule_doubles_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig::new(ms(250), ms(15_000), 10).unwrap());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        // Ten attempts, so nine waits in between.
        assert_eq!(
            delays,
            vec![250, 500, 1_000, 2_000, 4_000, 8_000, 15_000, 15_000, 15_000]
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(backoff.failures(), 10);
    }

    #[test]
    fn test_reset_starts_over_at_min() {
        let mut backoff = Backoff::new(BackoffConfig::new(ms(100), ms(1_000), 3).unwrap());
        assert_eq!(backoff.next_delay(), Some(ms(100)));
        assert_eq!(backoff.next_delay(), Some(ms(200)));
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Some(ms(100)));
    }

    #[test]
    fn test_zero_attempts_never_exhausts() {
        let mut backoff = Backoff::new(BackoffConfig::new(ms(1), ms(8), 0).unwrap());
        let last = (0..1_000).map(|_| backoff.next_delay()).last().flatten();
        assert_eq!(last, Some(ms(8)));
    }

    #[test]
    fn test_single_attempt_never_waits() {
        let mut backoff = Backoff::new(BackoffConfig::new(ms(250), ms(1_000), 1).unwrap());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.failures(), 1);
    }

    #[test]
    fn test_min_equal_to_max_is_constant() {
        let mut backoff = Backoff::new(BackoffConfig::new(ms(500), ms(500), 4).unwrap());
        for _ in 0..3 {
            assert_eq!(backoff.next_delay(), Some(ms(500)));
        }
        assert_eq!(backoff.next_delay(), None);
    }
}
