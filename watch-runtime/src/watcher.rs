//! Per-provider watcher: scheduled polling, hashed diffing, cached baseline.
//!
//! One [`ProviderWatcher`] is owned per provider by the controller. It holds
//! the only reference to that provider's [`Collector`], and is the single
//! writer of its baseline map — stats reads take the `RwLock` read side
//! concurrently with the poll loop's write side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::collector::{Collector, CollectorConfig};
use crate::error::WatcherError;
use crate::metrics::{WatcherStats, WatcherStatsHandle};
use crate::model::{Change, ChangeOp, EventKind, FieldValue, Resource, Snapshot, WatchEvent};

/// Static configuration for a [`ProviderWatcher`].
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub polling_interval: Duration,
    /// Per-poll deadline. Defaults to `5 * polling_interval`, capped at 10 minutes.
    pub poll_deadline: Option<Duration>,
    pub buffer_size: usize,
    pub collector_config: CollectorConfig,
}

impl WatcherConfig {
    pub fn new(polling_interval: Duration) -> Self {
        Self {
            polling_interval,
            poll_deadline: None,
            buffer_size: 1000,
            collector_config: CollectorConfig::default(),
        }
    }

    fn effective_poll_deadline(&self) -> Duration {
        self.poll_deadline.unwrap_or_else(|| {
            (self.polling_interval.saturating_mul(5)).min(Duration::from_secs(600))
        })
    }
}

#[derive(Debug, Clone)]
struct BaselineEntry {
    resource: Resource,
    fingerprint: String,
}

type Baseline = HashMap<String, BaselineEntry>;

/// Owns one provider's baseline and poll loop.
///
/// Generic over the [`Collector`] contract so unit tests can drive it with an
/// in-memory fake; the controller holds `ProviderWatcher<Arc<dyn Collector>>`.
#[derive(Debug)]
pub struct ProviderWatcher<C: Collector + ?Sized + 'static> {
    provider: String,
    collector: Arc<C>,
    config: WatcherConfig,
    baseline: Arc<RwLock<Baseline>>,
    stats: Arc<WatcherStatsHandle>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    id_counter: Arc<AtomicU64>,
    tx: Option<mpsc::Sender<WatchEvent>>,
    rx: Option<mpsc::Receiver<WatchEvent>>,
    interval_tx: watch::Sender<Duration>,
    interval_rx: watch::Receiver<Duration>,
}

impl<C: Collector + ?Sized + 'static> ProviderWatcher<C> {
    pub fn new(provider: impl Into<String>, collector: Arc<C>, config: WatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let (interval_tx, interval_rx) = watch::channel(config.polling_interval);
        Self {
            provider: provider.into(),
            collector,
            config,
            baseline: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(WatcherStatsHandle::default()),
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            task: None,
            id_counter: Arc::new(AtomicU64::new(0)),
            tx: Some(tx),
            rx: Some(rx),
            interval_tx,
            interval_rx,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Performs the initial baseline snapshot, then spawns the periodic poll loop.
    ///
    /// No events are emitted for the initial resource set: those resources are
    /// the baseline, not a change against one.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn start(&mut self) -> Result<(), WatcherError> {
        if self.task.is_some() {
            return Err(WatcherError::AlreadyRunning(self.provider.clone()));
        }

        match self.take_snapshot().await {
            Ok(snapshot) => {
                let mut baseline = self.baseline.write();
                *baseline = snapshot
                    .resources
                    .into_iter()
                    .map(|r| {
                        let fp = r.fingerprint();
                        (r.id.clone(), BaselineEntry { resource: r, fingerprint: fp })
                    })
                    .collect();
            }
            Err(()) => {
                warn!(provider = %self.provider, "initial snapshot failed; starting with an empty baseline");
            }
        }

        let provider = self.provider.clone();
        let collector = self.collector.clone();
        let mut config = self.config.clone();
        let baseline = self.baseline.clone();
        let stats = self.stats.clone();
        let clock = self.clock.clone();
        let cancel = self.cancel.clone();
        let id_counter = self.id_counter.clone();
        let tx = self
            .tx
            .clone()
            .expect("ProviderWatcher::start called after stop() closed the outbound channel");
        let mut interval_rx = self.interval_rx.clone();

        let span = tracing::info_span!("provider_watcher_loop", provider = %provider);
        self.task = Some(tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(config.polling_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // consume the immediate first tick; the caller already took the baseline snapshot.
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = interval_rx.changed() => {
                            if changed.is_err() {
                                continue;
                            }
                            let new_interval = *interval_rx.borrow_and_update();
                            if new_interval != config.polling_interval {
                                config.polling_interval = new_interval;
                                interval = tokio::time::interval(new_interval);
                                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                            }
                        }
                        _ = interval.tick() => {
                            poll_once(
                                &provider,
                                &*collector,
                                &config,
                                &baseline,
                                &stats,
                                &*clock,
                                &cancel,
                                &id_counter,
                                &tx,
                            )
                            .await;
                        }
                    }
                }
            }
            .instrument(span),
        ));
        Ok(())
    }

    /// Pushes a new polling cadence to an already-running poll loop (spec
    /// §4.5 hot reconfiguration). Takes effect on the loop's next select
    /// iteration; harmless to call before `start()` or after `stop()`.
    pub fn set_polling_interval(&mut self, interval: Duration) {
        self.config.polling_interval = interval;
        let _ = self.interval_tx.send(interval);
    }

    async fn take_snapshot(&self) -> Result<Snapshot, ()> {
        let deadline = self.config.effective_poll_deadline();
        match tokio::time::timeout(
            deadline,
            self.collector.collect(self.cancel.child_token(), &self.config.collector_config),
        )
        .await
        {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => {
                warn!(provider = %self.provider, error = %e, "collector error on initial snapshot");
                self.stats.record_error();
                Err(())
            }
            Err(_) => {
                warn!(provider = %self.provider, "collector timed out on initial snapshot");
                self.stats.record_error();
                Err(())
            }
        }
    }

    /// Cancels the poll loop, waits (up to `grace`) for it to finish in-flight
    /// work, then closes the outbound channel. The channel closes exactly
    /// once here: dropping `self.tx` (our clone) plus the task's clone, which
    /// is gone once the joined task exits, leaves no open sender regardless
    /// of whether the caller ever drops the `ProviderWatcher` itself.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn stop(&mut self, grace: Duration) -> Result<(), WatcherError> {
        let Some(task) = self.task.take() else {
            return Err(WatcherError::NotRunning(self.provider.clone()));
        };
        self.cancel.cancel();
        if tokio::time::timeout(grace, task).await.is_err() {
            warn!(provider = %self.provider, "poll loop did not stop within grace period");
        }
        self.tx.take();
        Ok(())
    }

    /// Returns the outbound event stream. May only be called once per watcher
    /// lifetime — subsequent calls return `None`.
    pub fn events(&mut self) -> Option<ReceiverStream<WatchEvent>> {
        self.rx.take().map(ReceiverStream::new)
    }

    pub fn stats(&self) -> WatcherStats {
        self.stats.snapshot()
    }

    pub fn baseline_len(&self) -> usize {
        self.baseline.read().len()
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_once<C: Collector + ?Sized>(
    provider: &str,
    collector: &C,
    config: &WatcherConfig,
    baseline: &RwLock<Baseline>,
    stats: &WatcherStatsHandle,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    id_counter: &AtomicU64,
    tx: &mpsc::Sender<WatchEvent>,
) {
    let deadline = config.effective_poll_deadline();
    let started = clock.now_instant();
    let snapshot = match tokio::time::timeout(
        deadline,
        collector.collect(cancel.child_token(), &config.collector_config),
    )
    .await
    {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            warn!(provider, error = %e, "collector error; baseline unchanged");
            stats.record_error();
            return;
        }
        Err(_) => {
            warn!(provider, "collector call exceeded poll deadline");
            stats.record_error();
            return;
        }
    };

    let events = diff_against_baseline(provider, baseline, snapshot, clock, id_counter);

    stats.record_scan(clock.now_instant().saturating_duration_since(started));

    for event in events {
        let at = event.timestamp;
        match tx.try_send(event) {
            Ok(()) => stats.record_emitted(at),
            Err(_) => {
                // baseline already reflects the change; only the announcement is lost.
                stats.record_drop();
            }
        }
    }
}

/// Computes the symmetric fingerprint diff between the current baseline and a
/// freshly collected snapshot, then atomically replaces the baseline.
fn diff_against_baseline(
    provider: &str,
    baseline: &RwLock<Baseline>,
    snapshot: Snapshot,
    clock: &dyn Clock,
    id_counter: &AtomicU64,
) -> Vec<WatchEvent> {
    let now = clock.now_utc();
    let mut next_id = || format!("{provider}-{}", id_counter.fetch_add(1, Ordering::Relaxed));

    let mut events = Vec::new();
    let mut fresh: Baseline = HashMap::with_capacity(snapshot.resources.len());
    for resource in snapshot.resources {
        let fingerprint = resource.fingerprint();
        fresh.insert(resource.id.clone(), BaselineEntry { resource, fingerprint });
    }

    {
        let old = baseline.read();
        for (id, new_entry) in &fresh {
            match old.get(id) {
                None => events.push(WatchEvent {
                    id: next_id(),
                    kind: EventKind::Created,
                    timestamp: now,
                    provider: provider.to_string(),
                    resource: new_entry.resource.clone(),
                    previous_hash: None,
                    current_hash: Some(new_entry.fingerprint.clone()),
                    changes: None,
                    metadata: Default::default(),
                }),
                Some(old_entry) if old_entry.fingerprint != new_entry.fingerprint => {
                    events.push(WatchEvent {
                        id: next_id(),
                        kind: EventKind::Modified,
                        timestamp: now,
                        provider: provider.to_string(),
                        resource: new_entry.resource.clone(),
                        previous_hash: Some(old_entry.fingerprint.clone()),
                        current_hash: Some(new_entry.fingerprint.clone()),
                        changes: Some(diff_resource_fields(&old_entry.resource, &new_entry.resource)),
                        metadata: Default::default(),
                    });
                }
                Some(_) => {} // identical fingerprint, no event
            }
        }
        for (id, old_entry) in old.iter() {
            if !fresh.contains_key(id) {
                events.push(WatchEvent {
                    id: next_id(),
                    kind: EventKind::Deleted,
                    timestamp: now,
                    provider: provider.to_string(),
                    resource: old_entry.resource.clone(),
                    previous_hash: Some(old_entry.fingerprint.clone()),
                    current_hash: None,
                    changes: None,
                    metadata: Default::default(),
                });
            }
        }
    }

    *baseline.write() = fresh;
    events
}

/// Semantic set diff over `configuration` and `tags`: added / removed /
/// modified keys. Ordering is irrelevant for these maps (they are
/// `BTreeMap`s keyed by field name), so no positional comparison is done.
fn diff_resource_fields(old: &Resource, new: &Resource) -> Vec<Change> {
    let mut changes = Vec::new();
    diff_map(&mut changes, "configuration", &old.configuration, &new.configuration, |v| v.to_string());
    diff_map(
        &mut changes,
        "tags",
        &old.tags,
        &new.tags,
        |v: &String| v.clone(),
    );
    changes
}

fn diff_map<V: PartialEq, F: Fn(&V) -> String>(
    out: &mut Vec<Change>,
    prefix: &str,
    old: &std::collections::BTreeMap<String, V>,
    new: &std::collections::BTreeMap<String, V>,
    render: F,
) {
    for (key, new_value) in new {
        let path = format!("{prefix}.{key}");
        match old.get(key) {
            None => out.push(Change {
                path,
                old: None,
                new: Some(render(new_value)),
                change_type: ChangeOp::Added,
            }),
            Some(old_value) if old_value != new_value => out.push(Change {
                path,
                old: Some(render(old_value)),
                new: Some(render(new_value)),
                change_type: ChangeOp::Modified,
            }),
            Some(_) => {}
        }
    }
    for (key, old_value) in old {
        if !new.contains_key(key) {
            out.push(Change {
                path: format!("{prefix}.{key}"),
                old: Some(render(old_value)),
                new: None,
                change_type: ChangeOp::Removed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectError;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use tokio_stream::StreamExt;

    #[derive(Debug)]
    struct FakeCollector {
        provider: String,
        snapshots: StdMutex<Vec<Snapshot>>,
    }

    #[async_trait]
    impl Collector for FakeCollector {
        fn provider(&self) -> &str {
            &self.provider
        }

        async fn collect(
            &self,
            _cancel: CancellationToken,
            _config: &CollectorConfig,
        ) -> Result<Snapshot, CollectError> {
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.is_empty() {
                return Err(CollectError::Other("exhausted".into()));
            }
            Ok(snapshots.remove(0))
        }

        async fn validate(&self, _config: &CollectorConfig) -> Result<(), CollectError> {
            Ok(())
        }
    }

    fn resource(id: &str, size: &str) -> Resource {
        let mut configuration = BTreeMap::new();
        configuration.insert("size".to_string(), FieldValue::String(size.to_string()));
        Resource {
            id: id.to_string(),
            kind: "vm".to_string(),
            name: "x".to_string(),
            namespace: None,
            region: Some("us1".to_string()),
            configuration,
            tags: BTreeMap::new(),
        }
    }

    fn snapshot(resources: Vec<Resource>) -> Snapshot {
        Snapshot {
            provider: "p".to_string(),
            timestamp: chrono::Utc::now(),
            resources,
        }
    }

    // S1: one resource changes `configuration.size`.
    #[tokio::test(start_paused = true)]
    async fn modify_produces_single_change() {
        let collector = Arc::new(FakeCollector {
            provider: "p".to_string(),
            snapshots: StdMutex::new(vec![
                snapshot(vec![resource("A", "small")]),
                snapshot(vec![resource("A", "large")]),
            ]),
        });
        let mut watcher = ProviderWatcher::new("p", collector, WatcherConfig::new(Duration::from_millis(10)));
        let mut events = watcher.events().unwrap();
        watcher.start().await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        let event = events.next().await.unwrap();
        assert_eq!(event.kind, EventKind::Modified);
        assert_eq!(event.resource.id, "A");
        let changes = event.changes.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "configuration.size");
        assert_ne!(event.previous_hash, event.current_hash);
        watcher.stop(Duration::from_secs(1)).await.unwrap();
    }

    // S2: create+delete in one poll.
    #[tokio::test(start_paused = true)]
    async fn create_and_delete_in_one_poll() {
        let collector = Arc::new(FakeCollector {
            provider: "p".to_string(),
            snapshots: StdMutex::new(vec![
                snapshot(vec![resource("A", "small")]),
                snapshot(vec![resource("B", "small")]),
            ]),
        });
        let mut watcher = ProviderWatcher::new("p", collector, WatcherConfig::new(Duration::from_millis(10)));
        let mut events = watcher.events().unwrap();
        watcher.start().await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        let mut kinds = vec![events.next().await.unwrap().kind, events.next().await.unwrap().kind];
        kinds.sort_by_key(|k| matches!(k, EventKind::Created));
        assert_eq!(kinds, vec![EventKind::Deleted, EventKind::Created]);
        watcher.stop(Duration::from_secs(1)).await.unwrap();
    }

    // S3 / P4: identical snapshots emit nothing.
    #[tokio::test(start_paused = true)]
    async fn no_change_is_silent() {
        let collector = Arc::new(FakeCollector {
            provider: "p".to_string(),
            snapshots: StdMutex::new(vec![
                snapshot(vec![resource("A", "small")]),
                snapshot(vec![resource("A", "small")]),
            ]),
        });
        let mut watcher = ProviderWatcher::new("p", collector, WatcherConfig::new(Duration::from_millis(10)));
        let mut events = watcher.events().unwrap();
        watcher.start().await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        // No event should ever arrive; give the loop a moment then assert empty.
        tokio::select! {
            _ = events.next() => panic!("unexpected event on identical snapshot"),
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }
        watcher.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn baseline_diff_is_fingerprint_complete() {
        // P1: |Created|+|Modified|+|Deleted| == symmetric fingerprint diff size.
        let old_resources = vec![resource("A", "small"), resource("B", "small")];
        let new_resources = vec![resource("A", "large"), resource("C", "small")];
        let baseline: Baseline = old_resources
            .iter()
            .map(|r| (r.id.clone(), BaselineEntry { resource: r.clone(), fingerprint: r.fingerprint() }))
            .collect();
        let lock = RwLock::new(baseline);
        let clock = SystemClock;
        let counter = AtomicU64::new(0);
        let events = diff_against_baseline("p", &lock, snapshot(new_resources), &clock, &counter);
        // A modified, B deleted, C created = 3 events.
        assert_eq!(events.len(), 3);
    }
}
