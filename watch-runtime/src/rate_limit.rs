//! A small token-bucket limiter used to bound collector call rates and,
//! optionally, sink submission rates.

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

/// A thread-safe token bucket.
///
/// `try_acquire` never blocks; callers that need to wait poll on their own
/// schedule, matching the "no suspension point is a bare blocking call"
/// rule in spec §5.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity as f64,
                capacity: capacity as f64,
                refill_per_sec: refill_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * bucket.refill_per_sec).min(bucket.capacity);
            bucket.last_refill = now;
        }
    }

    /// Attempts to take one token. Returns `true` if one was available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1.0)
    }

    pub fn try_acquire_n(&self, n: f64) -> bool {
        let mut bucket = self.bucket.lock();
        Self::refill(&mut bucket, Instant::now());
        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, for stats/introspection.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        Self::refill(&mut bucket, Instant::now());
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn exhausts_then_refills() {
        let limiter = RateLimiter::new(2, 1);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        assert!(limiter.try_acquire());
    }
}
