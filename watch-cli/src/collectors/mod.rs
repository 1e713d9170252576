//! Thin, illustrative [`watch_runtime::collector::Collector`] implementations.
//!
//! None of these call a real cloud API — authoring new provider collectors
//! is out of scope here, they exist only so `watch-cli` has something to
//! poll in a demo run. Each returns a small in-memory snapshot that churns a
//! little on every call so the pipeline has events to push through.

mod aws;
mod gcp;
mod kubernetes;
mod terraform;

pub use aws::AwsCollector;
pub use gcp::GcpCollector;
pub use kubernetes::KubernetesCollector;
pub use terraform::TerraformCollector;

use std::collections::BTreeMap;
use watch_runtime::model::{FieldValue, Resource};

/// Synthesizes a resource whose `configuration.size` flips on roughly every
/// third call, so watchers driven by these collectors emit a mix of
/// Modified/Created/Deleted events rather than staying silent forever.
pub(crate) fn churned_resource(id: &str, kind: &str, name: &str, region: Option<&str>, tick: u64) -> Resource {
    let size = if tick % 3 == 0 { "large" } else { "small" };
    let mut configuration = BTreeMap::new();
    configuration.insert("size".to_string(), FieldValue::String(size.to_string()));
    let mut tags = BTreeMap::new();
    tags.insert("managed-by".to_string(), "watch-cli-demo".to_string());
    Resource {
        id: id.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: None,
        region: region.map(str::to_string),
        configuration,
        tags,
    }
}
