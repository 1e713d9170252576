use async_trait::async_trait;
use tracing::info;
use watch_runtime::model::DeliveryEvent;
use watch_runtime::sink::{Sink, SinkError};

/// Pretty-prints delivered events via `tracing`, the way the rest of this
/// process logs everything else.
#[derive(Debug, Default)]
pub struct TerminalSink;

#[async_trait]
impl Sink for TerminalSink {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn deliver(&self, event: &DeliveryEvent) -> Result<(), SinkError> {
        info!(
            provider = %event.original_event.provider,
            kind = ?event.original_event.kind,
            resource = %event.original_event.resource.name,
            "delivered event"
        );
        Ok(())
    }
}
