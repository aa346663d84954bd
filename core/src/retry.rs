use std::cmp::min;
use std::time::Duration;

/// Exponential backoff parameters for failed deliveries.
///
/// The delay before attempt `n + 1` is `base_delay · factor^(n − 1)`, capped
/// at `max_delay`, which gives `10, 30, 90, 270, 810` seconds with the
/// default values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts before a task is marked failed
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied after each failed attempt
    pub factor: u32,
    /// Upper bound for the delay between two attempts
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(10),
            factor: 3,
            max_delay: Duration::from_secs(900),
        }
    }
}

/// What to do with a task after an attempt was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Delivery worked; the task is settled as succeeded.
    Success,
    /// Delivery failed but the retry budget is not exhausted; try again after
    /// the given delay.
    Retry { delay: Duration },
    /// Delivery failed and the retry budget is exhausted; the task is settled
    /// as failed.
    GiveUp,
}

impl RetryPolicy {
    /// Decide the fate of a task once attempt number `attempts_count` has
    /// finished (i.e. the counter already includes that attempt).
    pub fn decide(&self, delivered: bool, attempts_count: u32) -> Decision {
        if delivered {
            Decision::Success
        } else if attempts_count >= self.max_retries {
            Decision::GiveUp
        } else {
            Decision::Retry {
                delay: self.delay_after(attempts_count),
            }
        }
    }

    /// Delay to wait after `attempts_count` attempts have failed.
    pub fn delay_after(&self, attempts_count: u32) -> Duration {
        let exponent = attempts_count.saturating_sub(1);
        let seconds = self
            .base_delay
            .as_secs()
            .saturating_mul(u64::from(self.factor).saturating_pow(exponent));
        min(Duration::from_secs(seconds), self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_matches_documentation() {
        let policy = RetryPolicy::default();
        let delays = (1..=5)
            .map(|n| policy.delay_after(n).as_secs())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![10, 30, 90, 270, 810]);
    }

    #[test]
    fn delay_is_clamped_at_max_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(6), Duration::from_secs(900));
        assert_eq!(policy.delay_after(1000), Duration::from_secs(900));
    }

    #[test]
    fn success_always_wins() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(true, 1), Decision::Success);
        assert_eq!(policy.decide(true, 5), Decision::Success);
    }

    #[test]
    fn budget_exhaustion_gives_up() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(false, 5), Decision::GiveUp);
        assert_eq!(policy.decide(false, 6), Decision::GiveUp);
    }

    #[test]
    fn failures_within_budget_schedule_a_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(false, 1),
            Decision::Retry {
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            policy.decide(false, 4),
            Decision::Retry {
                delay: Duration::from_secs(270)
            }
        );
    }

    #[test]
    fn zero_max_retries_makes_the_first_failure_terminal() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.decide(false, 1), Decision::GiveUp);
    }

    #[test]
    fn custom_policy_from_scenario_two() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(900),
        };
        assert_eq!(
            policy.decide(false, 1),
            Decision::Retry {
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.decide(false, 2),
            Decision::Retry {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(policy.decide(false, 3), Decision::GiveUp);
    }
}
