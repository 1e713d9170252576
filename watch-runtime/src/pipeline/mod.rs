//! The delivery pipeline: a linear sequence of stages, each with its own
//! worker pool and bounded queue, fronted by a router and a circuit breaker
//! guarding the terminal sink.

pub mod backpressure;
pub mod circuit;
pub mod retry;
pub mod router;
pub mod stage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::PipelineError;
use crate::metrics::PipelineStats;
use crate::model::DeliveryEvent;
use crate::sink::Sink;
use backpressure::{Admission, BackpressureConfig, BackpressureManager};
use circuit::{CircuitBreaker, CircuitConfig};
use router::EventRouter;
use stage::{Stage, StageConfig, StageProcessor};

/// Outcome of [`DeliveryPipeline::submit`]. Always returned immediately —
/// the call never awaits a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    DroppedBackpressure,
    RejectedCircuitOpen,
    QueueFull,
}

/// A stage's static config paired with the processor that runs it. Kept
/// separate from `StageConfig` itself so the config half stays plain,
/// serializable data (per §6's enumerated `pipeline.stage[*]` schema) while
/// the processor — a trait object, not data — is supplied by the caller
/// wiring the pipeline together (the controller, or a test).
pub struct StageSpec {
    pub config: StageConfig,
    pub processor: Arc<dyn StageProcessor>,
}

struct StageGroup {
    stage: Stage,
    backpressure: BackpressureManager,
}

/// Configuration for the pipeline as a whole.
pub struct PipelineConfig {
    pub stages: Vec<StageSpec>,
    pub backpressure: BackpressureConfig,
    pub circuit: CircuitConfig,
    pub shutdown_grace: Duration,
}

/// A linear `route -> transform* -> deliver` pipeline.
///
/// Stage group names equal their `StageConfig::name`; the router dictates
/// which group an event enters at. Every group's output feeds the next
/// group in `stages` order; the last group's output feeds the sink, gated
/// by the circuit breaker.
pub struct DeliveryPipeline {
    groups: Vec<StageGroup>,
    group_index: HashMap<String, usize>,
    router: EventRouter,
    circuit: Arc<CircuitBreaker>,
    error_tx: broadcast::Sender<PipelineError>,
    shutdown_grace: Duration,
    sink_task: Option<tokio::task::JoinHandle<()>>,
    sink_cancel: tokio_util::sync::CancellationToken,
}

impl DeliveryPipeline {
    /// Builds and starts every stage, then spawns the tail task that drains
    /// the last stage's output through the circuit breaker into `sink`.
    pub fn start(config: PipelineConfig, router: EventRouter, sink: Arc<dyn Sink>) -> Self {
        Self::start_with_clock(config, router, sink, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        config: PipelineConfig,
        router: EventRouter,
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (error_tx, _) = broadcast::channel(256);
        let circuit = Arc::new(CircuitBreaker::new(config.circuit, clock));

        let (tail_tx, mut tail_rx) = mpsc::channel::<DeliveryEvent>(256);
        let sink_cancel = tokio_util::sync::CancellationToken::new();
        let sink_stats = Arc::new(RwLock::new(crate::metrics::StageStats::default()));
        let tail_circuit = circuit.clone();
        let tail_error_tx = error_tx.clone();
        let tail_cancel = sink_cancel.clone();
        let sink_task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tail_cancel.cancelled() => break,
                    event = tail_rx.recv() => match event {
                        Some(e) => e,
                        None => break,
                    },
                };
                match sink.deliver(&event).await {
                    Ok(()) => {
                        tail_circuit.record_success();
                        sink_stats.write().processed += 1;
                    }
                    Err(e) => {
                        tail_circuit.record_failure();
                        sink_stats.write().errors += 1;
                        let _ = tail_error_tx.send(PipelineError {
                            stage: "sink".to_string(),
                            event_id: event.original_event.id.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        });

        // Stages feed each other in sequence, with the last stage's output
        // feeding the sink wrapper built above. Wire back-to-front so each
        // stage is constructed with its already-running downstream sender.
        let mut downstream = tail_tx;
        let mut built: Vec<(String, Stage)> = Vec::with_capacity(config.stages.len());
        for spec in config.stages.into_iter().rev() {
            let name = spec.config.name.clone();
            let stage = Stage::spawn(spec.config, spec.processor, downstream, error_tx.clone());
            downstream = stage.downstream();
            built.push((name, stage));
        }
        built.reverse();

        let mut groups = Vec::with_capacity(built.len());
        let mut group_index = HashMap::new();
        for (idx, (name, stage)) in built.into_iter().enumerate() {
            group_index.insert(name, idx);
            let backpressure = BackpressureManager::new(config.backpressure.clone());
            groups.push(StageGroup { stage, backpressure });
        }

        Self {
            groups,
            group_index,
            router,
            circuit,
            error_tx,
            shutdown_grace: config.shutdown_grace,
            sink_task: Some(sink_task),
            sink_cancel,
        }
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.group_index.keys().cloned().collect()
    }

    /// Non-blocking submission entry point. Never awaits.
    #[instrument(skip(self, event), fields(event_id = %event.original_event.id))]
    pub fn submit(&self, event: DeliveryEvent) -> SubmitOutcome {
        if !self.circuit.try_acquire() {
            return SubmitOutcome::RejectedCircuitOpen;
        }

        let group_name = self.router.route(&event.original_event).to_string();
        let Some(&idx) = self.group_index.get(&group_name) else {
            warn!(group = %group_name, "router selected an unknown stage group; dropping");
            return SubmitOutcome::QueueFull;
        };
        let group = &self.groups[idx];

        match group.backpressure.admit(group.stage.queue_len()) {
            Admission::Drop => {
                group.stage.record_backpressure_drop();
                SubmitOutcome::DroppedBackpressure
            }
            Admission::DropOldest => {
                group.stage.try_evict_oldest();
                match group.stage.try_submit(event) {
                    Ok(()) => SubmitOutcome::Accepted,
                    Err(_) => SubmitOutcome::QueueFull,
                }
            }
            Admission::Accept => match group.stage.try_submit(event) {
                Ok(()) => SubmitOutcome::Accepted,
                Err(_) => SubmitOutcome::QueueFull,
            },
        }
    }

    pub fn errors(&self) -> broadcast::Receiver<PipelineError> {
        self.error_tx.subscribe()
    }

    pub fn stats(&self) -> PipelineStats {
        let per_stage = self
            .groups
            .iter()
            .map(|g| (g.stage.id().to_string(), g.stage.stats()))
            .collect();
        PipelineStats { per_stage, circuit_state: Some(self.circuit.state()) }
    }

    /// Drains each stage to completion up to the configured grace period;
    /// anything still queued past grace is dropped (counted by the stage's
    /// own stats, not separately here).
    pub async fn stop(mut self) {
        self.sink_cancel.cancel();
        if let Some(task) = self.sink_task.take() {
            let _ = tokio::time::timeout(self.shutdown_grace, task).await;
        }
        for group in self.groups {
            group.stage.stop(self.shutdown_grace).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, Resource, WatchEvent};
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn delivery_event(id: &str) -> DeliveryEvent {
        DeliveryEvent::new(WatchEvent {
            id: id.to_string(),
            kind: EventKind::Created,
            timestamp: chrono::Utc::now(),
            provider: "aws".to_string(),
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
        })
    }

    #[derive(Debug)]
    struct Identity;

    #[async_trait]
    impl StageProcessor for Identity {
        async fn process(&self, event: DeliveryEvent) -> stage::ProcessResult {
            Ok(event)
        }
    }

    #[derive(Debug)]
    struct AlwaysFail;

    #[async_trait]
    impl StageProcessor for AlwaysFail {
        async fn process(&self, _event: DeliveryEvent) -> stage::ProcessResult {
            Err("boom".to_string())
        }
    }

    #[derive(Debug)]
    struct CountingSink {
        delivered: Arc<AtomicU64>,
        fail: bool,
    }

    #[async_trait]
    impl Sink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn deliver(&self, _event: &DeliveryEvent) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Other("fails on purpose".to_string()));
            }
            self.delivered.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn one_stage_config() -> StageConfig {
        StageConfig {
            id: "route".to_string(),
            name: "default".to_string(),
            concurrency: 1,
            buffer: 4,
            per_event_timeout: Duration::from_secs(1),
            retry_policy: retry::RetryPolicy { max_attempts: 1, ..Default::default() },
            enabled: true,
        }
    }

    #[tokio::test]
    async fn event_reaches_sink_through_single_stage() {
        let delivered = Arc::new(AtomicU64::new(0));
        let sink = Arc::new(CountingSink { delivered: delivered.clone(), fail: false });
        let config = PipelineConfig {
            stages: vec![StageSpec { config: one_stage_config(), processor: Arc::new(Identity) }],
            backpressure: BackpressureConfig::default(),
            circuit: CircuitConfig::default(),
            shutdown_grace: Duration::from_secs(1),
        };
        let pipeline = DeliveryPipeline::start(config, EventRouter::new("default"), sink);

        assert_eq!(pipeline.submit(delivery_event("e1")), SubmitOutcome::Accepted);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        pipeline.stop().await;
    }

    // S6: processor permanently fails -> error stream gets one entry, sink
    // never sees the event.
    #[tokio::test]
    async fn permanent_failure_reaches_error_stream() {
        let delivered = Arc::new(AtomicU64::new(0));
        let sink = Arc::new(CountingSink { delivered: delivered.clone(), fail: false });
        let config = PipelineConfig {
            stages: vec![StageSpec { config: one_stage_config(), processor: Arc::new(AlwaysFail) }],
            backpressure: BackpressureConfig::default(),
            circuit: CircuitConfig::default(),
            shutdown_grace: Duration::from_secs(1),
        };
        let pipeline = DeliveryPipeline::start(config, EventRouter::new("default"), sink);
        let mut errors = pipeline.errors();

        pipeline.submit(delivery_event("e1"));
        let err = tokio::time::timeout(Duration::from_secs(1), errors.recv()).await.unwrap().unwrap();
        assert_eq!(err.event_id, "e1");
        assert_eq!(delivered.load(Ordering::Relaxed), 0);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn unknown_route_group_is_reported_as_queue_full() {
        let sink = Arc::new(CountingSink { delivered: Arc::new(AtomicU64::new(0)), fail: false });
        let config = PipelineConfig {
            stages: vec![StageSpec { config: one_stage_config(), processor: Arc::new(Identity) }],
            backpressure: BackpressureConfig::default(),
            circuit: CircuitConfig::default(),
            shutdown_grace: Duration::from_secs(1),
        };
        // router points at a group that doesn't exist
        let pipeline = DeliveryPipeline::start(config, EventRouter::new("nonexistent"), sink);
        assert_eq!(pipeline.submit(delivery_event("e1")), SubmitOutcome::QueueFull);
        pipeline.stop().await;
    }
}
