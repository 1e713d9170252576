//! Retry policy and backoff computation for a single delivery stage.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Constant,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// `backoff(attempt) = min(max_delay, initial_delay * multiplier^attempt)`,
    /// with exponential backoff jittered by ±10%.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            BackoffKind::Constant => self.initial_delay,
            BackoffKind::Exponential => {
                let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
                Duration::from_secs_f64(scaled)
            }
        };
        let capped = base.min(self.max_delay);
        match self.backoff {
            BackoffKind::Constant => capped,
            BackoffKind::Exponential => jitter(capped, 0.10),
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

fn jitter(base: Duration, fraction: f64) -> Duration {
    let delta = base.as_secs_f64() * fraction;
    let offset = rand::rng().random_range(-delta..=delta);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: BackoffKind::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        };
        let backoff = policy.backoff_for_attempt(10);
        assert!(backoff <= Duration::from_millis(1100));
    }

    #[test]
    fn constant_backoff_does_not_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffKind::Constant,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            multiplier: 1.0,
        };
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(50));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy { max_attempts: 3, ..Default::default() };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
