use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use watch_runtime::collector::{CollectError, Collector, CollectorConfig};
use watch_runtime::model::Snapshot;

use super::churned_resource;

/// Demo stand-in for an AWS resource collector (EC2/RDS-shaped, not a real
/// API caller).
#[derive(Debug, Default)]
pub struct AwsCollector {
    tick: AtomicU64,
}

#[async_trait]
impl Collector for AwsCollector {
    fn provider(&self) -> &str {
        "aws"
    }

    async fn collect(&self, _cancel: CancellationToken, config: &CollectorConfig) -> Result<Snapshot, CollectError> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let region = config.regions.first().map(String::as_str).unwrap_or("us1");
        Ok(Snapshot {
            provider: "aws".to_string(),
            timestamp: Utc::now(),
            resources: vec![churned_resource("aws-web", "ec2_instance", "web", Some(region), tick)],
        })
    }

    async fn validate(&self, _config: &CollectorConfig) -> Result<(), CollectError> {
        Ok(())
    }

    fn supported_regions(&self) -> Vec<String> {
        vec!["us1".to_string(), "us2".to_string(), "eu1".to_string()]
    }
}
