use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::options::ReconnectOptions;

/// Paces reconnection attempts with exponential backoff and gives up after too many failures
pub struct Supervisor {
    backoff: ExponentialBackoff,
    max_attempts: usize,
    attempts: usize,
}

impl Supervisor {
    pub fn new(opts: &ReconnectOptions) -> Self {
        Self { backoff: Self::backoff_strategy(opts), max_attempts: opts.max_attempts, attempts: 0 }
    }

    #[inline]
    fn backoff_strategy(opts: &ReconnectOptions) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(opts.initial_interval)
            .with_max_interval(opts.max_interval.max(opts.initial_interval))
            .with_multiplier(opts.multiplier.max(1.0))
            .with_randomization_factor(opts.randomization_factor.clamp(0.0, 1.0))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Failed attempts since the last successful connection
    #[inline]
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    #[inline]
    pub fn exhausted(&self) -> bool {
        self.max_attempts > 0 && self.attempts >= self.max_attempts
    }

    /// Delay before the next attempt, `None` once the attempt limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        self.attempts += 1;
        self.backoff.next_backoff()
    }

    /// A connection attempt succeeded
    #[inline]
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(max_attempts: usize) -> ReconnectOptions {
        ReconnectOptions {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let mut s = Supervisor::new(&opts(6));
        let delays = std::iter::from_fn(|| s.next_delay()).map(|d| d.as_secs()).collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4, 5, 5, 5]);
        assert!(s.exhausted());
        assert_eq!(s.attempts(), 6);

        s.reset();
        assert!(!s.exhausted());
        assert_eq!(s.next_delay().map(|d| d.as_secs()), Some(1));
    }

    #[test]
    fn test_unlimited_attempts() {
        let mut s = Supervisor::new(&opts(0));
        for _ in 0..100 {
            assert!(s.next_delay().is_some());
        }
        assert!(!s.exhausted());
    }

    #[test]
    fn test_jitter_bounds() {
        let mut s = Supervisor::new(&ReconnectOptions { randomization_factor: 0.5, ..opts(1) });
        let d = s.next_delay().unwrap();
        assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1501), "{:?}", d);
        assert_eq!(s.next_delay(), None);
    }
}
