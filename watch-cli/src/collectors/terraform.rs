use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use watch_runtime::collector::{CollectError, Collector, CollectorConfig};
use watch_runtime::model::Snapshot;

use super::churned_resource;

/// Demo stand-in for a Terraform state file reader.
#[derive(Debug, Default)]
pub struct TerraformCollector {
    tick: AtomicU64,
}

#[async_trait]
impl Collector for TerraformCollector {
    fn provider(&self) -> &str {
        "terraform"
    }

    async fn collect(&self, _cancel: CancellationToken, _config: &CollectorConfig) -> Result<Snapshot, CollectError> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        Ok(Snapshot {
            provider: "terraform".to_string(),
            timestamp: Utc::now(),
            resources: vec![
                churned_resource("tf-web", "aws_instance", "web", Some("us1"), tick),
                churned_resource("tf-db", "aws_db_instance", "db", Some("us1"), tick + 1),
            ],
        })
    }

    async fn validate(&self, _config: &CollectorConfig) -> Result<(), CollectError> {
        Ok(())
    }
}
