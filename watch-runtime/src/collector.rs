//! The `Collect` contract consumed from provider-specific back ends.
//!
//! Authoring real provider collectors (terraform/aws/gcp/kubernetes) is out
//! of scope for this crate — this module only defines the interface a
//! [`crate::watcher::ProviderWatcher`] drives.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::Snapshot;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("collector call was cancelled")]
    Cancelled,
    #[error("collector call timed out")]
    Timeout,
    #[error("collector error: {0}")]
    Other(String),
}

/// Per-provider collector configuration, passed through unopened.
#[derive(Debug, Clone, Default)]
pub struct CollectorConfig {
    pub regions: Vec<String>,
    pub namespaces: Vec<String>,
    pub resource_types: Vec<String>,
}

/// The contract every provider collector implements. Collectors are
/// stateless across calls — all state the watch pipeline needs lives in
/// the [`crate::watcher::ProviderWatcher`]'s baseline, not here.
#[async_trait]
pub trait Collector: Send + Sync + std::fmt::Debug {
    /// Identifies the provider this collector serves, e.g. `"aws"`.
    fn provider(&self) -> &str;

    /// Takes one snapshot of the provider's resources.
    async fn collect(
        &self,
        cancel: CancellationToken,
        config: &CollectorConfig,
    ) -> Result<Snapshot, CollectError>;

    /// Validates a configuration without taking a snapshot.
    async fn validate(&self, config: &CollectorConfig) -> Result<(), CollectError>;

    /// Best-effort auto-discovery of a usable configuration.
    async fn auto_discover(&self) -> Result<CollectorConfig, CollectError> {
        Ok(CollectorConfig::default())
    }

    /// Regions the collector knows how to target, if region-scoped.
    fn supported_regions(&self) -> Vec<String> {
        Vec::new()
    }
}
