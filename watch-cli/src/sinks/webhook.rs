use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use watch_runtime::model::{ChangeOp, DeliveryEvent};
use watch_runtime::sink::{Sink, SinkError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// POSTs a change summary to a fixed URL using `hyper_util::client::legacy`
/// and `http-body-util` directly, rather than pulling in a higher-level
/// HTTP client crate for a single POST.
pub struct WebhookSink {
    url: hyper::Uri,
    timeout: Duration,
    client: Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>,
}

impl std::fmt::Debug for WebhookSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSink").field("url", &self.url).finish()
    }
}

#[derive(Serialize)]
struct WebhookSummary {
    total: usize,
    added: usize,
    modified: usize,
    removed: usize,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    timestamp: chrono::DateTime<chrono::Utc>,
    source: &'a str,
    summary: WebhookSummary,
    groups: Vec<&'a str>,
    raw_changes: &'a [watch_runtime::model::Change],
}

impl WebhookSink {
    pub fn new(url: hyper::Uri) -> Self {
        Self { url, timeout: DEFAULT_TIMEOUT, client: Client::builder(TokioExecutor::new()).build_http() }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &DeliveryEvent) -> Result<(), SinkError> {
        let empty = Vec::new();
        let changes = event.original_event.changes.as_ref().unwrap_or(&empty);
        let added = changes.iter().filter(|c| c.change_type == ChangeOp::Added).count();
        let modified = changes.iter().filter(|c| c.change_type == ChangeOp::Modified).count();
        let removed = changes.iter().filter(|c| c.change_type == ChangeOp::Removed).count();

        let body = WebhookBody {
            timestamp: event.processed_at,
            source: &event.original_event.provider,
            summary: WebhookSummary { total: changes.len().max(1), added, modified, removed },
            groups: event.tags.iter().map(String::as_str).collect(),
            raw_changes: changes,
        };
        let payload = serde_json::to_vec(&body).map_err(|e| SinkError::Other(e.to_string()))?;

        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(self.url.clone())
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| SinkError::Other(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| SinkError::Timeout)?
            .map_err(|e| SinkError::Other(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SinkError::Other(format!("webhook returned {}", response.status())));
        }
        let _ = response.into_body().collect().await;
        Ok(())
    }
}
