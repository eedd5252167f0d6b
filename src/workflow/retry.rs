//! Retry budget for looping workflow steps.
//!
//! A step that routes back into itself (the batch monitor) is guarded by a
//! [`RetryPolicy`]: the engine waits [`RetryPolicy::delay_for`] before every
//! entry and stops the loop once the attempt count or the wall-clock deadline
//! is used up.

use std::time::{Duration, Instant};

use rand::Rng;

/// Polling/backoff policy with a hard stop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt; 1.0 keeps the delay fixed.
    pub backoff_factor: f64,
    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
    /// Maximum number of entries into the guarded step.
    pub max_attempts: u32,
    /// Wall-clock budget measured from the first entry.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.0,
            jitter: false,
            max_attempts: 30,
            deadline: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval policy.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            max_attempts,
            ..Self::default()
        }
    }

    /// Exponential policy capped at `max_delay`.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff_factor: 2.0,
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt.min(32) as i32);
        let capped = if self.initial_delay.as_secs_f64() * factor >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            self.initial_delay.mul_f64(factor)
        };
        if self.jitter && !capped.is_zero() {
            let spread = capped.as_secs_f64() * 0.1;
            capped + Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=spread))
        } else {
            capped
        }
    }
}

/// Attempt bookkeeping for one guarded step during one run.
#[derive(Debug, Clone)]
pub(crate) struct RetryBudget {
    attempts: u32,
    started: Option<Instant>,
}

impl RetryBudget {
    pub(crate) fn new() -> Self {
        Self {
            attempts: 0,
            started: None,
        }
    }

    /// Record an entry into the guarded step; returns the 0-based attempt index.
    pub(crate) fn enter(&mut self) -> u32 {
        self.started.get_or_insert_with(Instant::now);
        let attempt = self.attempts;
        self.attempts += 1;
        attempt
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another entry is still allowed under `policy`.
    pub(crate) fn allows_another(&self, policy: &RetryPolicy) -> bool {
        if self.attempts >= policy.max_attempts {
            return false;
        }
        match self.started {
            Some(started) => started.elapsed() < policy.deadline,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_stays_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(50), 3);
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(5), Duration::from_millis(50));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy =
            RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(350), 10);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(9), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::fixed(Duration::from_millis(100), 3).with_jitter(true);
        for attempt in 0..20 {
            let d = policy.delay_for(attempt);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(111));
        }
    }

    #[test]
    fn budget_exhausts_on_attempts() {
        let policy = RetryPolicy::fixed(Duration::ZERO, 2);
        let mut budget = RetryBudget::new();
        assert!(budget.allows_another(&policy));
        assert_eq!(budget.enter(), 0);
        assert!(budget.allows_another(&policy));
        assert_eq!(budget.enter(), 1);
        assert!(!budget.allows_another(&policy));
        assert_eq!(budget.attempts(), 2);
    }

    #[test]
    fn budget_exhausts_on_deadline() {
        let policy = RetryPolicy::fixed(Duration::ZERO, 100).with_deadline(Duration::ZERO);
        let mut budget = RetryBudget::new();
        budget.enter();
        assert!(!budget.allows_another(&policy));
    }
}
