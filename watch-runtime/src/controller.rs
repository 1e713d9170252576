//! Lifecycle owner: wires provider watchers into the merger, the merger into
//! the correlator, and the correlator's combined stream into an outbound
//! channel consumers subscribe to. Control flow is strictly top-down — no
//! component below the controller holds a reference back up to it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::collector::Collector;
use crate::config::Config;
use crate::correlator::Correlator;
use crate::error::{ConfigError, ControllerError};
use crate::merger::EventMerger;
use crate::metrics::ControllerStats;
use crate::model::WatchEvent;
use crate::watcher::{ProviderWatcher, WatcherConfig};

type AnyWatcher = ProviderWatcher<dyn Collector>;

struct ProviderEntry {
    watcher: AnyWatcher,
    collector: Arc<dyn Collector>,
}

/// Owns every provider watcher, the merger, the correlator, and (optionally)
/// a delivery pipeline; the single place that starts and stops the whole
/// concurrent watch pipeline.
pub struct Controller {
    config: RwLock<Config>,
    providers: Arc<RwLock<HashMap<String, ProviderEntry>>>,
    merger: Arc<RwLock<EventMerger>>,
    correlator: Arc<Correlator>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    running: RwLock<bool>,
    outbound_tx: mpsc::Sender<WatchEvent>,
    outbound_rx: RwLock<Option<mpsc::Receiver<WatchEvent>>>,
    forward_task: RwLock<Option<JoinHandle<()>>>,
    stats_task: RwLock<Option<JoinHandle<()>>>,
    stats: Arc<std::sync::RwLock<ControllerStats>>,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        Self::new_with_clock(config, Arc::new(SystemClock))
    }

    pub fn new_with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.buffer_size.max(1));
        let correlator = Arc::new(Correlator::new(config.correlation.history_size));
        let merger = EventMerger::new(config.buffer_size).with_clock(clock.clone());
        Ok(Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
            merger: Arc::new(RwLock::new(merger)),
            correlator,
            clock,
            cancel: CancellationToken::new(),
            running: RwLock::new(false),
            outbound_tx,
            outbound_rx: RwLock::new(Some(outbound_rx)),
            forward_task: RwLock::new(None),
            stats_task: RwLock::new(None),
            stats: Arc::new(std::sync::RwLock::new(ControllerStats::default())),
            config: RwLock::new(config),
        })
    }

    /// Registers a provider's collector and constructs its watcher. Valid
    /// whether or not the controller is currently running — a provider
    /// added while running is started immediately and wired into the
    /// merger; at rest it takes effect on the next `start`.
    #[instrument(skip(self, collector), fields(provider = %provider))]
    pub async fn add_provider(
        &self,
        provider: impl Into<String>,
        collector: Arc<dyn Collector>,
    ) -> Result<(), ControllerError> {
        let provider = provider.into();
        {
            let providers = self.providers.read().await;
            if providers.contains_key(&provider) {
                return Err(ControllerError::ProviderExists(provider));
            }
        }

        let (interval, buffer_size, collector_config) = {
            let config = self.config.read().await;
            (
                config.polling_interval_for(&provider),
                config.buffer_size,
                crate::collector::CollectorConfig {
                    regions: config.regions.clone(),
                    namespaces: config.namespaces.clone(),
                    resource_types: config.resource_types.clone(),
                },
            )
        };
        let mut watcher_config = WatcherConfig::new(interval);
        watcher_config.buffer_size = buffer_size;
        watcher_config.collector_config = collector_config;
        let mut watcher: AnyWatcher =
            ProviderWatcher::new(&provider, collector.clone(), watcher_config).with_clock(self.clock.clone());

        let was_running = *self.running.read().await;
        if was_running {
            let stream = watcher.events().expect("fresh watcher always has an event stream");
            watcher.start().await?;
            self.merger.read().await.add_source(provider.clone(), stream)?;
        }

        self.providers.write().await.insert(provider, ProviderEntry { watcher, collector });
        Ok(())
    }

    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn remove_provider(&self, provider: &str) -> Result<(), ControllerError> {
        let mut entry = self
            .providers
            .write()
            .await
            .remove(provider)
            .ok_or_else(|| ControllerError::ProviderNotFound(provider.to_string()))?;
        let _ = self.merger.read().await.remove_source(provider);
        let _ = entry.watcher.stop(Duration::from_secs(5)).await;
        Ok(())
    }

    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn restart_provider(&self, provider: &str) -> Result<(), ControllerError> {
        let collector = {
            let providers = self.providers.read().await;
            let entry =
                providers.get(provider).ok_or_else(|| ControllerError::ProviderNotFound(provider.to_string()))?;
            entry.collector.clone()
        };
        self.remove_provider(provider).await?;
        self.add_provider(provider, collector).await
    }

    pub async fn active_providers(&self) -> Vec<String> {
        self.providers.read().await.keys().cloned().collect()
    }

    /// Ordered start sequence (spec §4.5): init watchers (already
    /// constructed by `add_provider`) → start the merger → start the
    /// correlator (stateless, nothing to do) → start each watcher and wire
    /// its stream into the merger → launch the merger→correlator→outbound
    /// forwarding loop → launch the stats-refresh loop.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ControllerError> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(ControllerError::AlreadyRunning);
            }
            *running = true;
        }

        self.merger.read().await.start();

        {
            let mut providers = self.providers.write().await;
            for (name, entry) in providers.iter_mut() {
                let stream = entry.watcher.events().expect("watcher not yet started");
                entry.watcher.start().await?;
                self.merger.read().await.add_source(name.clone(), stream)?;
            }
        }

        let merger_stream = self.merger.write().await.events().expect("outbound stream taken exactly once");
        let correlator = self.correlator.clone();
        let outbound_tx = self.outbound_tx.clone();
        let forward_cancel = self.cancel.child_token();
        *self.forward_task.write().await = Some(tokio::spawn(
            run_forwarding_loop(merger_stream, correlator, outbound_tx, forward_cancel)
                .instrument(tracing::info_span!("controller_forward_loop")),
        ));

        let stats = self.stats.clone();
        let merger = self.merger.clone();
        let providers = self.providers.clone();
        let correlator = self.correlator.clone();
        let clock = self.clock.clone();
        let stats_cancel = self.cancel.child_token();
        *self.stats_task.write().await = Some(tokio::spawn(
            run_stats_refresh_loop(stats, merger, providers, correlator, clock, stats_cancel)
                .instrument(tracing::info_span!("controller_stats_loop")),
        ));

        info!("controller started");
        Ok(())
    }

    /// Reverse of `start`: stops the forwarding and stats loops, stops every
    /// watcher, stops the merger. The outbound channel closes exactly once,
    /// implicitly, when `outbound_tx` (and every clone of it) is dropped —
    /// held only by the controller and the now-stopped forwarding loop.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), ControllerError> {
        {
            let mut running = self.running.write().await;
            if !*running {
                return Err(ControllerError::NotRunning);
            }
            *running = false;
        }

        self.cancel.cancel();
        if let Some(task) = self.stats_task.write().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        if let Some(task) = self.forward_task.write().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }

        let mut providers = self.providers.write().await;
        for (name, entry) in providers.iter_mut() {
            if let Err(e) = entry.watcher.stop(Duration::from_secs(5)).await {
                warn!(provider = %name, error = %e, "watcher stop failed during controller shutdown");
            }
        }
        self.merger.read().await.stop();

        Ok(())
    }

    /// Changes per-provider polling intervals, the merger buffer size (only
    /// while not running), or correlation rules. Provider membership
    /// changes go through `add_provider`/`remove_provider`, not this call.
    #[instrument(skip(self, new_config))]
    pub async fn update_config(&self, new_config: Config) -> Result<(), ControllerError> {
        new_config.validate()?;

        let running = *self.running.read().await;
        let current_buffer = self.config.read().await.buffer_size;
        if running && new_config.buffer_size != current_buffer {
            return Err(ControllerError::Config(ConfigError::BufferResizeWhileRunning));
        }

        for rule in &new_config.correlation.rules {
            self.correlator.add_rule(rule.clone());
        }

        {
            let mut providers = self.providers.write().await;
            for (name, entry) in providers.iter_mut() {
                let interval = new_config.polling_interval_for(name);
                entry.watcher.set_polling_interval(interval);
            }
        }

        *self.config.write().await = new_config;
        Ok(())
    }

    /// Returns the outbound stream. May only be taken once.
    pub async fn events(&self) -> Option<ReceiverStream<WatchEvent>> {
        self.outbound_rx.write().await.take().map(ReceiverStream::new)
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats.read().unwrap().clone()
    }
}

async fn run_forwarding_loop(
    mut merger_stream: ReceiverStream<WatchEvent>,
    correlator: Arc<Correlator>,
    outbound_tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            next = merger_stream.next() => match next {
                Some(event) => event,
                None => return,
            },
        };

        // Primary event is always forwarded before its derived correlated
        // events (spec §5 ordering guarantee).
        let correlated = correlator.process_event(&event);
        if outbound_tx.try_send(event).is_err() {
            warn!("outbound channel full; primary event dropped");
        }
        for derived in correlated {
            if outbound_tx.try_send(derived.0).is_err() {
                warn!("outbound channel full; correlated event dropped");
            }
        }
    }
}

async fn run_stats_refresh_loop(
    stats: Arc<std::sync::RwLock<ControllerStats>>,
    merger: Arc<RwLock<EventMerger>>,
    providers: Arc<RwLock<HashMap<String, ProviderEntry>>>,
    correlator: Arc<Correlator>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let provider_stats: HashMap<String, crate::metrics::WatcherStats> = {
                    let providers = providers.read().await;
                    providers.iter().map(|(name, entry)| (name.clone(), entry.watcher.stats())).collect()
                };
                let merger_stats = merger.read().await.stats();
                let mut s = stats.write().unwrap();
                s.providers = provider_stats;
                s.merger = merger_stats;
                s.correlator = correlator.stats();
                s.last_refreshed = Some(clock.now_utc());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectError, CollectorConfig};
    use crate::model::{EventKind, FieldValue, Resource, Snapshot};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken as CancelToken;

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

        async fn collect(&self, _cancel: CancelToken, _config: &CollectorConfig) -> Result<Snapshot, CollectError> {
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

    fn resource(id: &str) -> Resource {
        let mut configuration = BTreeMap::new();
        configuration.insert("size".to_string(), FieldValue::String("small".to_string()));
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

    #[tokio::test(start_paused = true)]
    async fn start_then_stop_lifecycle() {
        let mut config = Config::default();
        config.providers.push("aws".to_string());
        config.polling_intervals.insert("aws".to_string(), crate::config::PollingInterval(Duration::from_millis(10)));
        let controller = Controller::new(config).unwrap();

        let collector = Arc::new(FakeCollector {
            provider: "aws".to_string(),
            snapshots: StdMutex::new(vec![
                Snapshot { provider: "aws".to_string(), timestamp: chrono::Utc::now(), resources: vec![resource("A")] },
                Snapshot { provider: "aws".to_string(), timestamp: chrono::Utc::now(), resources: vec![] },
            ]),
        });
        controller.add_provider("aws", collector).await.unwrap();
        assert_eq!(controller.active_providers().await, vec!["aws".to_string()]);

        let mut events = controller.events().await.unwrap();
        controller.start().await.unwrap();
        assert!(matches!(controller.start().await, Err(ControllerError::AlreadyRunning)));

        tokio::time::advance(Duration::from_millis(10)).await;
        let event = events.next().await.unwrap();
        assert_eq!(event.kind, EventKind::Deleted);

        controller.stop().await.unwrap();
        assert!(matches!(controller.stop().await, Err(ControllerError::NotRunning)));
    }

    #[tokio::test]
    async fn add_provider_rejects_duplicate() {
        let controller = Controller::new(Config::default()).unwrap();
        let collector = Arc::new(FakeCollector { provider: "aws".to_string(), snapshots: StdMutex::new(vec![]) });
        controller.add_provider("aws", collector.clone()).await.unwrap();
        assert!(matches!(
            controller.add_provider("aws", collector).await,
            Err(ControllerError::ProviderExists(_))
        ));
    }

    #[tokio::test]
    async fn remove_unknown_provider_errors() {
        let controller = Controller::new(Config::default()).unwrap();
        assert!(matches!(
            controller.remove_provider("aws").await,
            Err(ControllerError::ProviderNotFound(_))
        ));
    }
}
