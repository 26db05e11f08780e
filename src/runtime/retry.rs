use std::time::Duration;

/// Backoff applied between attempts of a retried activity.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    Fixed {
        delay: Duration,
    },
    /// `base * attempt`, capped at `max`.
    Linear {
        base: Duration,
        max: Duration,
    },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after `attempt` (1-based) failed, before the next one starts.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                if base.is_zero() {
                    return Duration::ZERO;
                }
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.powi(exp);
                let millis = base.as_millis() as f64 * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis.max(0.0) as u64)
                }
            }
        }
    }
}

/// Retry policy for activities scheduled by an orchestration.
///
/// Only `Timeout` and `TransientError` failures are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Per-attempt timeout overriding `RuntimeOptions::activity_timeout`.
    pub timeout: Option<Duration>,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: None,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// # Panics
    ///
    /// Panics if `max_attempts` is 0.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_three_attempts_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.timeout.is_none());
        assert_eq!(
            policy.backoff,
            BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                max: Duration::from_secs(30),
            }
        );
    }

    #[test]
    #[should_panic(expected = "max_attempts must be at least 1")]
    fn zero_attempts_rejected() {
        let _ = RetryPolicy::new(0);
    }

    #[test]
    fn builders_override_fields() {
        let policy = RetryPolicy::new(5)
            .with_timeout(Duration::from_secs(2))
            .with_backoff(BackoffStrategy::None);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.timeout, Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for_attempt(4), Duration::ZERO);
    }

    #[test]
    fn linear_caps_at_max() {
        let backoff = BackoffStrategy::Linear {
            base: Duration::from_millis(100),
            max: Duration::from_millis(250),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(250));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn exponential_grows_then_caps() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(10_000), Duration::from_millis(500));
    }
}
