use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `base_interval * factor^(attempt - 1)`, jittered and capped at
/// `max_interval`.
///
/// Two independent bounds end the iteration:
/// - `max_attempts`, the number of delays handed out.
/// - the retry window, the sum of all delays handed out. The last delay is shortened so that the
///   total never exceeds the window.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let backoff = Exponential::from_millis(100, 1_000, 2.0, 0.0, None)
///     .with_retry_window(Duration::from_millis(500));
///
/// // 100 + 200 + 200 (shortened from 400 to stay inside the window)
/// let delays: Vec<_> = backoff.collect();
/// assert_eq!(delays.len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    /// Between 0.0 and 1.0.
    jitter: f64,
    /// None retries until the window (if any) is exhausted.
    max_attempts: Option<u16>,
    retry_window: Option<Duration>,
    current_attempt: u16,
    elapsed: Duration,
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
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            retry_window: None,
            current_attempt: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn from_millis(
        base_interval_ms: u64,
        max_interval_ms: u64,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms),
            Duration::from_millis(max_interval_ms),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Bounds the total time spent sleeping between attempts.
    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = Some(window);
        self
    }

    /// Starts over, e.g., after an attempt finally succeeded.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
        self.elapsed = Duration::ZERO;
    }

    pub fn current_attempt(&self) -> u16 {
        self.current_attempt
    }

    /// Total sleep handed out since creation or the last [`Exponential::reset`].
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn calculate_delay(&self, attempt: u16) -> Duration {
        // attempt is at least 1 here, powi(-1) would shrink the base
        let exponent = i32::from(attempt.max(1) - 1);
        let base_delay_ms = (self.base_interval.as_millis() as f64) * self.factor.powi(exponent);

        let delay_ms = if self.jitter == 0.0 {
            base_delay_ms
        } else {
            let jitter_factor: f64 =
                rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
            base_delay_ms * jitter_factor
        };

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

        let mut delay = self.calculate_delay(self.current_attempt.saturating_add(1));

        if let Some(window) = self.retry_window {
            let remaining = window.saturating_sub(self.elapsed);
            if remaining.is_zero() {
                return None;
            }
            delay = delay.min(remaining);
        }

        self.current_attempt = self.current_attempt.saturating_add(1);
        self.elapsed += delay;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_no_jitter() {
        let mut backoff = Exponential::from_millis(100, 10_000, 2.0, 0.0, None);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn test_max_interval_cap() {
        let mut backoff = Exponential::from_millis(100, 300, 2.0, 0.0, None);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_max_attempts() {
        let backoff = Exponential::from_millis(10, 1_000, 2.0, 0.0, Some(3));
        assert_eq!(backoff.count(), 3);
    }

    #[test]
    fn test_retry_window_shortens_last_delay() {
        let backoff = Exponential::from_millis(100, 10_000, 2.0, 0.0, None)
            .with_retry_window(Duration::from_millis(500));

        let delays: Vec<Duration> = backoff.collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(200),
            ]
        );
    }

    #[test]
    fn test_window_and_attempts_whichever_first() {
        let backoff = Exponential::from_millis(10, 10, 1.0, 0.0, Some(2))
            .with_retry_window(Duration::from_secs(60));
        assert_eq!(backoff.count(), 2);

        let backoff = Exponential::from_millis(10, 10, 1.0, 0.0, Some(100))
            .with_retry_window(Duration::from_millis(35));
        let total: Duration = backoff.sum();
        assert_eq!(total, Duration::from_millis(35));
    }

    #[test]
    fn test_reset_restores_window_and_attempts() {
        let mut backoff = Exponential::from_millis(100, 10_000, 2.0, 0.0, None)
            .with_retry_window(Duration::from_millis(300));

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.elapsed(), Duration::from_millis(300));

        backoff.reset();
        assert_eq!(backoff.current_attempt(), 0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_applied() {
        let mut backoff = Exponential::from_millis(100, 10_000, 2.0, 0.5, None);

        // 50% jitter keeps the first delay within [50ms, 150ms]
        let delay = backoff.next().unwrap();
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
    }
}
