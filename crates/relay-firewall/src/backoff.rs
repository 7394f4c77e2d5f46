//! Exponential backoff for link, tunnel and lease retries.

use rand::Rng;
use relay_core::{RelayError, RelayResult};
use std::time::Duration;

/// Growth parameters for a retry sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Pause after a failed `accept`, typically out of file descriptors.
    pub fn accept_errors() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.initial.is_zero() {
            return Err(RelayError::Config("backoff initial interval must be positive".into()));
        }
        if self.max < self.initial {
            return Err(RelayError::Config(
                "backoff max interval is below the initial interval".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(RelayError::Config("backoff multiplier must be >= 1".into()));
        }
        Ok(())
    }
}

/// Retry state: each call to [`Backoff::next_delay`] returns an interval no
/// shorter than the previous one, capped at `policy.max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: None,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.policy.initial,
            Some(prev) => prev.mul_f64(self.policy.multiplier),
        };
        let next = next.min(self.policy.max);
        self.current = Some(next);
        self.attempts = self.attempts.saturating_add(1);
        next
    }

    /// Next delay plus 0-25% random jitter, for retries several instances
    /// may run in lockstep.
    pub fn next_delay_with_jitter(&mut self) -> Duration {
        let base = self.next_delay();
        let quarter = base.as_millis() as u64 / 4;
        if quarter == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=quarter);
        base + Duration::from_millis(jitter)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let mut b = Backoff::new(BackoffPolicy::default());
        let delays: Vec<u64> = (0..9).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(b.attempts(), 9);
    }

    #[test]
    fn delays_never_decrease() {
        let mut b = Backoff::new(BackoffPolicy {
            initial: Duration::from_millis(300),
            max: Duration::from_millis(5000),
            multiplier: 1.5,
        });
        let mut prev = Duration::ZERO;
        for _ in 0..50 {
            let d = b.next_delay();
            assert!(d >= prev);
            assert!(d <= Duration::from_millis(5000));
            prev = d;
        }
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut b = Backoff::new(BackoffPolicy::default());
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let mut b = Backoff::new(BackoffPolicy::default());
        for expected in [1000u64, 2000, 4000] {
            let d = b.next_delay_with_jitter().as_millis() as u64;
            assert!(d >= expected && d <= expected + expected / 4, "{d}");
        }
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let mut p = BackoffPolicy::default();
        p.multiplier = 0.5;
        assert!(p.validate().is_err());

        let p = BackoffPolicy {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert!(p.validate().is_err());
        assert!(BackoffPolicy::default().validate().is_ok());
    }
}
