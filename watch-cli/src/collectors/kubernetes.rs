use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use watch_runtime::collector::{CollectError, Collector, CollectorConfig};
use watch_runtime::model::{FieldValue, Resource, Snapshot};

/// Demo stand-in for a Kubernetes collector (pod/deployment-shaped, not a
/// real cluster API client).
#[derive(Debug, Default)]
pub struct KubernetesCollector {
    tick: AtomicU64,
}

#[async_trait]
impl Collector for KubernetesCollector {
    fn provider(&self) -> &str {
        "kubernetes"
    }

    async fn collect(&self, _cancel: CancellationToken, config: &CollectorConfig) -> Result<Snapshot, CollectError> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let namespace = config.namespaces.first().map(String::as_str).unwrap_or("default");
        let replicas = if tick % 3 == 0 { "3" } else { "2" };
        let mut configuration = std::collections::BTreeMap::new();
        configuration.insert("replicas".to_string(), FieldValue::String(replicas.to_string()));
        Ok(Snapshot {
            provider: "kubernetes".to_string(),
            timestamp: Utc::now(),
            resources: vec![Resource {
                id: "k8s-web".to_string(),
                kind: "deployment".to_string(),
                name: "web".to_string(),
                namespace: Some(namespace.to_string()),
                region: None,
                configuration,
                tags: std::collections::BTreeMap::new(),
            }],
        })
    }

    async fn validate(&self, _config: &CollectorConfig) -> Result<(), CollectError> {
        Ok(())
    }
}
