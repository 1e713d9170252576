//! Error taxonomy for the watch pipeline, per component.
//!
//! Transient/retryable failures are not represented here at all — they
//! never leave their owning component, they only move a stats counter
//! (see spec §7). These enums cover the failures that *are* surfaced:
//! configuration errors and controller lifecycle errors.

use thiserror::Error;

/// Synchronous configuration validation failure.
///
/// Returned from `Start`/`AddProvider`/`UpdateConfig` before anything is
/// spawned, never from inside a running poll/forward/correlate loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown provider identifier: {0}")]
    UnknownProvider(String),
    #[error("polling interval for provider {provider} must be positive, got {millis}ms")]
    NonPositiveInterval { provider: String, millis: u64 },
    #[error("buffer_size must be at least 1")]
    EmptyBuffer,
    #[error("correlation rule {0} has an empty providers list")]
    EmptyRuleProviders(String),
    #[error("correlation rule {0} has a zero-length window but that is only valid when explicitly allowed")]
    ZeroWindowRule(String),
    #[error("pipeline stage {0} must have at least one worker (concurrency >= 1)")]
    ZeroConcurrency(String),
    #[error("cannot change buffer_size while the merger is running")]
    BufferResizeWhileRunning,
}

/// Lifecycle-level controller error.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller is already running")]
    AlreadyRunning,
    #[error("controller is not running")]
    NotRunning,
    #[error("provider {0} is already registered")]
    ProviderExists(String),
    #[error("provider {0} is not registered")]
    ProviderNotFound(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("watcher lifecycle error: {0}")]
    Watcher(#[from] WatcherError),
    #[error("merger lifecycle error: {0}")]
    Merger(#[from] MergerError),
}

/// A permanent (post-retry) failure surfaced on the pipeline's error stream.
#[derive(Debug, Clone, Error)]
#[error("stage {stage} permanently failed to process event {event_id}: {reason}")]
pub struct PipelineError {
    pub stage: String,
    pub event_id: String,
    pub reason: String,
}

/// Lifecycle error for a single [`crate::watcher::ProviderWatcher`].
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watcher for provider {0} is already running")]
    AlreadyRunning(String),
    #[error("watcher for provider {0} is not running")]
    NotRunning(String),
}

/// Lifecycle error for the [`crate::merger::EventMerger`].
#[derive(Debug, Error)]
pub enum MergerError {
    #[error("source {0} is already registered")]
    SourceExists(String),
    #[error("source {0} is not registered")]
    SourceNotFound(String),
}
