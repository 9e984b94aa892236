use std::time::Duration;

use rand::Rng;

/// An exponential backoff strategy. The delay for attempt `n` is
/// `base_interval * factor^(n - 1)`, jittered and capped at `max_interval`.
/// With `max_attempts = None` it yields delays forever.
#[derive(Debug, Clone)]
pub struct Exponential {
    /// The base retry interval (starting point).
    base_interval: Duration,
    /// The maximum retry interval (cap).
    max_interval: Duration,
    /// The factor to multiply the interval with for each retry attempt.
    factor: f64,
    /// Jitter value between 0.0 and 1.0 for randomization.
    jitter: f64,
    /// The maximum number of retry attempts. If None, retries indefinitely.
    max_attempts: Option<u16>,
    current_attempt: u16,
}

impl Exponential {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter,
            max_attempts,
            current_attempt: 0,
        }
    }

    pub fn from_millis(
        base_interval_ms: u32,
        max_interval_ms: u32,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms as u64),
            Duration::from_millis(max_interval_ms as u64),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Resets the attempt counter back to 0.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn current_attempt(&self) -> u16 {
        self.current_attempt
    }

    fn calculate_delay(&self, attempt: u16) -> Duration {
        // clamp attempt to at least 1 to avoid powi(-1) when attempt = 0
        let safe_attempt = attempt.max(1);
        let base_delay_ms =
            (self.base_interval.as_millis() as f64) * self.factor.powi((safe_attempt - 1) as i32);

        if self.jitter == 0.0 {
            return Duration::from_millis(base_delay_ms as u64).min(self.max_interval);
        }

        // jitter is a value between 0 and 1; the delay is scaled by a random
        // factor in [1 - jitter, 1 + jitter]
        let jitter_factor: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        let delay_ms = base_delay_ms * jitter_factor;

        Duration::from_millis(delay_ms as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.current_attempt >= max_attempts
        {
            return None;
        }

        self.current_attempt += 1;
        Some(self.calculate_delay(self.current_attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth_no_jitter() {
        let mut backoff = Exponential::from_millis(100, 10000, 2.0, 0.0, None);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn max_interval_cap() {
        let mut backoff = Exponential::from_millis(100, 300, 2.0, 0.0, None);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
    }

    #[test]
    fn max_attempts() {
        let mut backoff = Exponential::from_millis(100, 10000, 2.0, 0.0, Some(3));

        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert_eq!(backoff.next(), None);
    }

    #[test]
    fn reset() {
        let mut backoff = Exponential::from_millis(100, 10000, 2.0, 0.0, None);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));

        backoff.reset();

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn jitter_applied() {
        let mut backoff = Exponential::from_millis(100, 10000, 2.0, 0.5, None);

        // with 50% jitter, the first delay is in [50ms, 150ms]
        let delay = backoff.next().unwrap();
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn attempt_tracking() {
        let mut backoff = Exponential::from_millis(100, 10000, 2.0, 0.0, None);

        assert_eq!(backoff.current_attempt(), 0);
        backoff.next();
        assert_eq!(backoff.current_attempt(), 1);
        backoff.next();
        assert_eq!(backoff.current_attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.current_attempt(), 0);
    }
}
