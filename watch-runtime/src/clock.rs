//! A single time source, threaded into every component that needs "now".
//!
//! Centralizing on one [`Clock`] (rather than calling `Utc::now()`/
//! `Instant::now()` ad hoc throughout the pipeline) is what makes the
//! circuit breaker, backoff scheduler, and correlator history eviction
//! deterministically testable with `tokio::time::pause`/`advance`.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Abstracts wall-clock and monotonic time.
///
/// The default [`SystemClock`] simply delegates to `chrono`/`tokio::time`;
/// tests use it directly together with `tokio::time::pause()` rather than
/// a bespoke fake, since `tokio::time::advance` already moves
/// `Instant::now()` deterministically under `#[tokio::test(start_paused =
/// true)]`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_utc(&self) -> DateTime<Utc>;
    fn now_instant(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_instant(&self) -> Instant {
        Instant::now()
    }
}
