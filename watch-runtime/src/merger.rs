//! Fan-in of `1..N` provider event streams into a single outbound stream.
//!
//! Each source gets its own forwarder task; a forwarder never blocks the
//! shared outbound channel — a full channel means the event is dropped, not
//! queued, so one slow consumer cannot stall any producer.

use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::error::MergerError;
use crate::metrics::{MergerStats, SourceStats};
use crate::model::WatchEvent;

struct SourceHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Multiplexes provider event streams into one outbound `WatchEvent` stream.
#[derive(Debug)]
pub struct EventMerger {
    buffer_size: usize,
    outbound_tx: mpsc::Sender<WatchEvent>,
    outbound_rx: Option<mpsc::Receiver<WatchEvent>>,
    sources: Arc<RwLock<HashMap<String, SourceHandle>>>,
    per_source_stats: Arc<RwLock<HashMap<String, SourceStats>>>,
    total_forwarded: Arc<std::sync::atomic::AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl EventMerger {
    pub fn new(buffer_size: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size.max(1));
        Self {
            buffer_size: buffer_size.max(1),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            sources: Arc::new(RwLock::new(HashMap::new())),
            per_source_stats: Arc::new(RwLock::new(HashMap::new())),
            total_forwarded: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// No-op lifecycle hook kept for parity with spec §4.2's `Start()`:
    /// forwarders are actually started by [`EventMerger::add_source`], since
    /// "`AddSource` while running launches a forwarder immediately" already
    /// covers the running case.
    pub fn start(&self) {}

    /// Registers a new provider source and immediately starts forwarding it.
    #[instrument(skip(self, stream), fields(provider = %provider))]
    pub fn add_source(
        &self,
        provider: impl Into<String>,
        stream: impl Stream<Item = WatchEvent> + Send + 'static,
    ) -> Result<(), MergerError> {
        let provider = provider.into();
        let mut sources = self.sources.write();
        if sources.contains_key(&provider) {
            return Err(MergerError::SourceExists(provider));
        }

        self.per_source_stats.write().insert(provider.clone(), SourceStats::default());

        let cancel = CancellationToken::new();
        let outbound_tx = self.outbound_tx.clone();
        let per_source_stats = self.per_source_stats.clone();
        let total_forwarded = self.total_forwarded.clone();
        let clock = self.clock.clone();
        let task_cancel = cancel.clone();
        let task_provider = provider.clone();

        let span = tracing::info_span!("merger_forwarder", provider = %task_provider);
        let task = tokio::spawn(
            async move {
                forward_source(task_provider, stream, outbound_tx, per_source_stats, total_forwarded, clock, task_cancel).await;
            }
            .instrument(span),
        );

        sources.insert(provider, SourceHandle { cancel, task });
        Ok(())
    }

    /// Stops the forwarder for `provider` and removes its stats entry.
    #[instrument(skip(self), fields(provider = %provider))]
    pub fn remove_source(&self, provider: &str) -> Result<(), MergerError> {
        let handle = self.sources.write().remove(provider).ok_or_else(|| MergerError::SourceNotFound(provider.to_string()))?;
        handle.cancel.cancel();
        handle.task.abort();
        self.per_source_stats.write().remove(provider);
        Ok(())
    }

    /// Returns the merged outbound stream. May only be taken once.
    pub fn events(&mut self) -> Option<ReceiverStream<WatchEvent>> {
        self.outbound_rx.take().map(ReceiverStream::new)
    }

    pub fn stats(&self) -> MergerStats {
        let per_source = self.per_source_stats.read().clone();
        let capacity = self.outbound_tx.max_capacity();
        let available = self.outbound_tx.capacity();
        let buffer_utilization = if capacity == 0 {
            0.0
        } else {
            1.0 - (available as f64 / capacity as f64)
        };
        MergerStats {
            total_forwarded: self.total_forwarded.load(std::sync::atomic::Ordering::Relaxed),
            per_source,
            buffer_utilization,
        }
    }

    pub fn stop(&self) {
        let mut sources = self.sources.write();
        for (_, handle) in sources.drain() {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

async fn forward_source(
    provider: String,
    mut stream: impl Stream<Item = WatchEvent> + Send + Unpin,
    outbound_tx: mpsc::Sender<WatchEvent>,
    per_source_stats: Arc<RwLock<HashMap<String, SourceStats>>>,
    total_forwarded: Arc<std::sync::atomic::AtomicU64>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let latency = (clock.now_utc() - event.timestamp).to_std().unwrap_or_default();
        match outbound_tx.try_send(event) {
            Ok(()) => {
                total_forwarded.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if let Some(stats) = per_source_stats.write().get_mut(&provider) {
                    let n = stats.forwarded;
                    let prev_total = stats.avg_forward_latency.as_secs_f64() * n as f64;
                    stats.forwarded += 1;
                    stats.avg_forward_latency =
                        std::time::Duration::from_secs_f64((prev_total + latency.as_secs_f64()) / stats.forwarded as f64);
                    stats.last_event_time = Some(clock.now_utc());
                }
            }
            Err(_) => {
                if let Some(stats) = per_source_stats.write().get_mut(&provider) {
                    stats.drops += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, Resource};
    use std::collections::BTreeMap;

    fn event(provider: &str) -> WatchEvent {
        WatchEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind: EventKind::Created,
            timestamp: chrono::Utc::now(),
            provider: provider.to_string(),
            resource: Resource {
                id: "A".into(),
                kind: "vm".into(),
                name: "x".into(),
                namespace: None,
                region: None,
                configuration: BTreeMap::new(),
                tags: BTreeMap::new(),
            },
            previous_hash: None,
            current_hash: None,
            changes: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn forwards_from_multiple_sources() {
        let mut merger = EventMerger::new(10);
        let mut events = merger.events().unwrap();

        let (tx_a, rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        merger.add_source("aws", ReceiverStream::new(rx_a)).unwrap();
        merger.add_source("gcp", ReceiverStream::new(rx_b)).unwrap();

        tx_a.send(event("aws")).await.unwrap();
        tx_b.send(event("gcp")).await.unwrap();

        let mut seen = vec![events.next().await.unwrap().provider, events.next().await.unwrap().provider];
        seen.sort();
        assert_eq!(seen, vec!["aws".to_string(), "gcp".to_string()]);
        assert_eq!(merger.stats().total_forwarded, 2);
    }

    // P6 / S5: a bounded outbound channel drops instead of growing.
    #[tokio::test]
    async fn drops_when_outbound_is_full() {
        let mut merger = EventMerger::new(2);
        let _events = merger.events().unwrap();
        let (tx, rx) = mpsc::channel(16);
        merger.add_source("aws", ReceiverStream::new(rx)).unwrap();

        for _ in 0..10 {
            tx.send(event("aws")).await.unwrap();
        }
        // give the forwarder a chance to drain into the bounded outbound channel
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let stats = merger.stats();
        let source_stats = stats.per_source.get("aws").unwrap();
        assert_eq!(source_stats.forwarded + source_stats.drops, 10);
        assert!(source_stats.drops > 0);
    }

    #[tokio::test]
    async fn remove_source_drops_stats_entry() {
        let mut merger = EventMerger::new(4);
        let _events = merger.events().unwrap();
        let (_tx, rx) = mpsc::channel::<WatchEvent>(4);
        merger.add_source("aws", ReceiverStream::new(rx)).unwrap();
        assert!(merger.stats().per_source.contains_key("aws"));
        merger.remove_source("aws").unwrap();
        assert!(!merger.stats().per_source.contains_key("aws"));
    }
}
