use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use watch_runtime::model::DeliveryEvent;
use watch_runtime::sink::{Sink, SinkError};

/// Appends newline-delimited JSON (the canonical `WatchEvent` wire shape
/// from spec §6) to an async writer, one line per delivered event.
pub struct JsonSink<W> {
    writer: Mutex<W>,
}

impl<W> std::fmt::Debug for JsonSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSink").finish()
    }
}

impl<W: tokio::io::AsyncWrite + Unpin + Send> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }
}

#[async_trait]
impl<W: tokio::io::AsyncWrite + Unpin + Send> Sink for JsonSink<W> {
    fn name(&self) -> &str {
        "json"
    }

    async fn deliver(&self, event: &DeliveryEvent) -> Result<(), SinkError> {
        let line = serde_json::to_string(&event.original_event).map_err(|e| SinkError::Other(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await.map_err(|e| SinkError::Other(e.to_string()))?;
        writer.write_all(b"\n").await.map_err(|e| SinkError::Other(e.to_string()))?;
        writer.flush().await.map_err(|e| SinkError::Other(e.to_string()))?;
        Ok(())
    }
}
