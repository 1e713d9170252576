//! Load tracking and drop-policy enforcement for a single stage's input queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    Oldest,
    Newest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    pub max_queue_size: usize,
    pub throttle_threshold: f64,
    pub drop_policy: DropPolicy,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            throttle_threshold: 0.8,
            drop_policy: DropPolicy::Newest,
        }
    }
}

/// Tracks `load = queue_len / max_queue_size` for a stage and decides, under
/// `drop_policy`, what happens to a submission once `throttle_threshold` is
/// reached. `oldest` makes room by evicting the queue's front; `newest`
/// rejects the incoming submission outright.
#[derive(Debug)]
pub struct BackpressureManager {
    config: BackpressureConfig,
    dropped: AtomicU64,
    callbacks_fired: AtomicU64,
    soft_queue: Mutex<VecDeque<()>>,
}

pub enum Admission {
    Accept,
    Drop,
    DropOldest,
}

impl BackpressureManager {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            dropped: AtomicU64::new(0),
            callbacks_fired: AtomicU64::new(0),
            soft_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn load(&self, current_len: usize) -> f64 {
        if self.config.max_queue_size == 0 {
            return 1.0;
        }
        current_len as f64 / self.config.max_queue_size as f64
    }

    /// Decides what to do with a submission given the stage's current queue
    /// length. Does not mutate the queue itself — callers apply the
    /// resulting [`Admission`].
    pub fn admit(&self, current_len: usize) -> Admission {
        if self.load(current_len) < self.config.throttle_threshold {
            return Admission::Accept;
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.callbacks_fired.fetch_add(1, Ordering::Relaxed);
        match self.config.drop_policy {
            DropPolicy::Oldest => Admission::DropOldest,
            DropPolicy::Newest => Admission::Drop,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_below_threshold() {
        let bp = BackpressureManager::new(BackpressureConfig {
            max_queue_size: 10,
            throttle_threshold: 0.8,
            drop_policy: DropPolicy::Newest,
        });
        assert!(matches!(bp.admit(5), Admission::Accept));
        assert_eq!(bp.dropped(), 0);
    }

    #[test]
    fn drops_newest_at_threshold() {
        let bp = BackpressureManager::new(BackpressureConfig {
            max_queue_size: 10,
            throttle_threshold: 0.8,
            drop_policy: DropPolicy::Newest,
        });
        assert!(matches!(bp.admit(8), Admission::Drop));
        assert_eq!(bp.dropped(), 1);
    }

    #[test]
    fn evicts_oldest_at_threshold() {
        let bp = BackpressureManager::new(BackpressureConfig {
            max_queue_size: 10,
            throttle_threshold: 0.8,
            drop_policy: DropPolicy::Oldest,
        });
        assert!(matches!(bp.admit(9), Admission::DropOldest));
    }
}
