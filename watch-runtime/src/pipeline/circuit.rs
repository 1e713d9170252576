//! The tri-state circuit breaker wrapping the pipeline's terminal sink.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<tokio::time::Instant>,
    probes_issued: u32,
}

/// `Closed` → `Open` on `failure_threshold` consecutive failures.
/// `Open` → `HalfOpen` once `reset_timeout` has elapsed since the last failure.
/// `HalfOpen` → `Closed` on `success_threshold` consecutive successes.
/// `HalfOpen` → `Open` on any failure. Up to 3 probes are allowed per
/// `HalfOpen` window; further submissions are rejected without invoking the
/// processor.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Inner>,
    clock: std::sync::Arc<dyn Clock>,
}

const MAX_PROBES_PER_HALF_OPEN: u32 = 3;

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
                probes_issued: 0,
            }),
            clock,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.refresh_transition();
        self.inner.lock().state
    }

    /// Call before attempting a delivery. Returns `true` if the call may
    /// proceed (and, if `HalfOpen`, consumes one probe slot); `false` means
    /// reject with `rejected_circuit_open` without invoking the processor.
    pub fn try_acquire(&self) -> bool {
        self.refresh_transition();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probes_issued < MAX_PROBES_PER_HALF_OPEN {
                    inner.probes_issued += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    debug!("circuit closing after {} consecutive successes", inner.consecutive_successes);
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.probes_issued = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(self.clock.now_instant());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    info!("circuit opening after {} consecutive failures", inner.consecutive_failures);
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                info!("probe failed, circuit re-opening");
                inner.state = CircuitState::Open;
                inner.consecutive_successes = 0;
                inner.probes_issued = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn refresh_transition(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(last_failure) = inner.last_failure {
                if self.clock.now_instant().saturating_duration_since(last_failure) >= self.config.reset_timeout {
                    debug!("reset_timeout elapsed, circuit entering half-open probe window");
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.probes_issued = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::Arc;

    fn breaker(config: CircuitConfig) -> CircuitBreaker {
        CircuitBreaker::new(config, Arc::new(SystemClock))
    }

    // P7 / S6: full open -> half-open -> closed cycle.
    #[tokio::test(start_paused = true)]
    async fn full_circuit_cycle() {
        let cb = breaker(CircuitConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
        });

        for _ in 0..5 {
            assert!(cb.try_acquire());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        for _ in 0..3 {
            assert!(cb.try_acquire());
            cb.record_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_cap_is_three() {
        let cb = breaker(CircuitConfig::default());
        for _ in 0..5 {
            cb.try_acquire();
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire());
        assert!(cb.try_acquire());
        assert!(cb.try_acquire());
        assert!(!cb.try_acquire(), "a fourth probe beyond the cap must be rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let cb = breaker(CircuitConfig::default());
        for _ in 0..5 {
            cb.try_acquire();
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.try_acquire());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
