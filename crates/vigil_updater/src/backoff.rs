//! Exponential backoff with multiplicative jitter.

use rand::Rng;
use std::time::Duration;

/// `delay_n = min(max_delay, initial * multiplier^n)`, jittered by
/// `delay * (1 ± jitter)`. `next_delay` returns `None` once the configured
/// retry budget is spent; `reset` returns to attempt zero.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    max_retries: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64, max_retries: u32) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            max_retries,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` when retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let exp = self.initial.as_secs_f64() * self.multiplier.powi(self.attempt as i32);
        let capped = exp.min(self.max.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * factor
        } else {
            capped
        };
        self.attempt += 1;
        Some(Duration::from_secs_f64(jittered.max(0.0)))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(30 * 60), 2.0, 0.2, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_up_to_the_cap() {
        let mut backoff = Backoff::new(
            Duration::from_secs(10),
            Duration::from_secs(60),
            2.0,
            0.0,
            10,
        );
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(40)));
        // Capped
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(60)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn exhausts_after_max_retries() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
            0.0,
            3,
        );
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn reset_restores_the_budget() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
            0.0,
            1,
        );
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn jitter_stays_within_band() {
        let mut backoff = Backoff::new(
            Duration::from_secs(100),
            Duration::from_secs(1_000),
            1.0,
            0.25,
            100,
        );
        for _ in 0..50 {
            let delay = backoff.next_delay().unwrap().as_secs_f64();
            assert!((75.0..=125.0).contains(&delay), "delay {} out of band", delay);
        }
    }
}
