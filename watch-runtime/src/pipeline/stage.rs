//! A single delivery-pipeline stage: a bounded input queue drained by a pool
//! of workers, each applying a per-event timeout and the stage's retry
//! policy before forwarding downstream or giving up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{instrument, warn, Instrument};

use super::retry::RetryPolicy;
use crate::metrics::StageStats;
use crate::model::DeliveryEvent;

/// The result of one processor invocation.
pub type ProcessResult = Result<DeliveryEvent, String>;

/// The contract every stage processor implements: `(event) -> result`.
///
/// Kept as a trait over a function value (per REDESIGN FLAGS: "express as a
/// function value / trait / interface, not inheritance") so both delivery
/// transforms and the terminal sink wrapper share one shape.
#[async_trait]
pub trait StageProcessor: Send + Sync + std::fmt::Debug {
    async fn process(&self, event: DeliveryEvent) -> ProcessResult;
}

/// A `StageProcessor` built from a plain async closure, for stages that
/// don't warrant a dedicated type (tests, simple enrichment steps).
pub struct FnProcessor<F>(pub F);

impl<F> std::fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProcessor").finish()
    }
}

#[async_trait]
impl<F, Fut> StageProcessor for FnProcessor<F>
where
    F: Fn(DeliveryEvent) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ProcessResult> + Send,
{
    async fn process(&self, event: DeliveryEvent) -> ProcessResult {
        (self.0)(event).await
    }
}

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub id: String,
    pub name: String,
    pub concurrency: usize,
    pub buffer: usize,
    pub per_event_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub enabled: bool,
}

struct WorkItem {
    event: DeliveryEvent,
    attempt: u32,
}

/// A running stage: worker pool, retry scheduler, and the channel the next
/// hop (another stage, or the pipeline's sink wrapper) reads from.
pub struct Stage {
    config: StageConfig,
    work_tx: mpsc::Sender<WorkItem>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    stats: Arc<RwLock<StageStats>>,
    total_processed: Arc<AtomicU64>,
    workers: Vec<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    downstream_tx: mpsc::Sender<DeliveryEvent>,
}

impl Stage {
    /// Spawns the stage's worker pool and retry scheduler.
    ///
    /// `downstream_tx` is where successfully processed events are forwarded:
    /// either the next stage's submit channel or the pipeline's sink-wrapper
    /// channel when this is the tail stage.
    pub fn spawn(
        config: StageConfig,
        processor: Arc<dyn StageProcessor>,
        downstream_tx: mpsc::Sender<DeliveryEvent>,
        error_tx: tokio::sync::broadcast::Sender<crate::error::PipelineError>,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::channel(config.buffer.max(1));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel::<(WorkItem, Duration)>();
        let stats = Arc::new(RwLock::new(StageStats::default()));
        let total_processed = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let retry_task = tokio::spawn(
            run_retry_scheduler(retry_rx, work_tx.clone(), stats.clone(), cancel.child_token())
                .instrument(tracing::info_span!("stage_retry", stage = %config.id)),
        );

        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let mut workers = Vec::with_capacity(config.concurrency.max(1));
        for worker_id in 0..config.concurrency.max(1) {
            let work_rx = work_rx.clone();
            let processor = processor.clone();
            let downstream_tx = downstream_tx.clone();
            let retry_tx = retry_tx.clone();
            let stats = stats.clone();
            let total_processed = total_processed.clone();
            let retry_policy = config.retry_policy.clone();
            let per_event_timeout = config.per_event_timeout;
            let stage_id = config.id.clone();
            let error_tx = error_tx.clone();
            let cancel = cancel.child_token();
            let span = tracing::info_span!("stage_worker", stage = %stage_id, worker_id);
            workers.push(tokio::spawn(
                async move {
                    run_worker(
                        work_rx,
                        processor,
                        downstream_tx,
                        retry_tx,
                        retry_policy,
                        per_event_timeout,
                        stage_id,
                        stats,
                        total_processed,
                        error_tx,
                        cancel,
                    )
                    .await;
                }
                .instrument(span),
            ));
        }

        Self {
            config,
            work_tx,
            work_rx,
            stats,
            total_processed,
            workers,
            retry_task: Some(retry_task),
            cancel,
            downstream_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current input queue occupancy, used by the backpressure manager.
    pub fn queue_len(&self) -> usize {
        self.config.buffer.saturating_sub(self.work_tx.capacity())
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.buffer.max(1)
    }

    /// Non-blocking submit into this stage's own queue. Never awaits.
    pub fn try_submit(&self, event: DeliveryEvent) -> Result<(), DeliveryEvent> {
        match self.work_tx.try_send(WorkItem { event, attempt: 0 }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => Err(item.event),
            Err(mpsc::error::TrySendError::Closed(item)) => Err(item.event),
        }
    }

    /// Evicts one item from the front of the input queue to make room for a
    /// new submission (the `oldest` backpressure drop policy, §4.4). A
    /// worker may be mid-`recv` holding the queue lock; in that case eviction
    /// is skipped for this submission rather than blocking the caller, since
    /// `submit` never awaits.
    pub fn try_evict_oldest(&self) -> bool {
        match self.work_rx.try_lock() {
            Ok(mut rx) => {
                if rx.try_recv().is_ok() {
                    self.stats.write().dropped_backpressure += 1;
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        }
    }

    /// Records a backpressure drop that didn't go through eviction (the
    /// `newest`/default drop policy: the incoming event itself is rejected,
    /// nothing is evicted from the queue).
    pub fn record_backpressure_drop(&self) {
        self.stats.write().dropped_backpressure += 1;
    }

    pub fn stats(&self) -> StageStats {
        self.stats.read().clone()
    }

    pub fn downstream(&self) -> mpsc::Sender<DeliveryEvent> {
        self.downstream_tx.clone()
    }

    /// Drains the stage up to `grace`, then aborts remaining workers,
    /// counting anything still in flight as dropped.
    #[instrument(skip(self), fields(stage = %self.config.id))]
    pub async fn stop(mut self, grace: Duration) {
        self.cancel.cancel();
        if let Some(retry_task) = self.retry_task.take() {
            let _ = tokio::time::timeout(grace, retry_task).await;
        }
        for worker in self.workers.drain(..) {
            if tokio::time::timeout(grace, worker).await.is_err() {
                warn!(stage = %self.config.id, "stage worker did not stop within grace period");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    processor: Arc<dyn StageProcessor>,
    downstream_tx: mpsc::Sender<DeliveryEvent>,
    retry_tx: mpsc::UnboundedSender<(WorkItem, Duration)>,
    retry_policy: RetryPolicy,
    per_event_timeout: Duration,
    stage_id: String,
    stats: Arc<RwLock<StageStats>>,
    total_processed: Arc<AtomicU64>,
    error_tx: tokio::sync::broadcast::Sender<crate::error::PipelineError>,
    cancel: CancellationToken,
) {
    loop {
        let item = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else { return };

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(per_event_timeout, processor.process(item.event.clone())).await;

        match result {
            Ok(Ok(processed)) => {
                let n = total_processed.fetch_add(1, Ordering::Relaxed) + 1;
                let mut s = stats.write();
                s.processed += 1;
                let prev_total = s.avg_latency.as_secs_f64() * (n - 1) as f64;
                s.avg_latency = Duration::from_secs_f64((prev_total + started.elapsed().as_secs_f64()) / n as f64);
                drop(s);
                let _ = downstream_tx.try_send(processed);
            }
            Ok(Err(reason)) => {
                handle_failure(item, reason, &retry_tx, &retry_policy, &stage_id, &stats, &error_tx);
            }
            Err(_) => {
                handle_failure(
                    item,
                    "per-event timeout exceeded".to_string(),
                    &retry_tx,
                    &retry_policy,
                    &stage_id,
                    &stats,
                    &error_tx,
                );
            }
        }
    }
}

fn handle_failure(
    item: WorkItem,
    reason: String,
    retry_tx: &mpsc::UnboundedSender<(WorkItem, Duration)>,
    retry_policy: &RetryPolicy,
    stage_id: &str,
    stats: &RwLock<StageStats>,
    error_tx: &tokio::sync::broadcast::Sender<crate::error::PipelineError>,
) {
    if retry_policy.should_retry(item.attempt) {
        stats.write().retried += 1;
        let delay = retry_policy.backoff_for_attempt(item.attempt);
        let event_id = item.event.original_event.id.clone();
        let next = WorkItem { event: item.event, attempt: item.attempt + 1 };
        if retry_tx.send((next, delay)).is_err() {
            warn!(stage = stage_id, event_id, "retry scheduler is gone, dropping event");
        }
    } else {
        stats.write().errors += 1;
        let _ = error_tx.send(crate::error::PipelineError {
            stage: stage_id.to_string(),
            event_id: item.event.original_event.id.clone(),
            reason,
        });
    }
}

/// Drives a `DelayQueue` of pending retries. No dedup: each retry is keyed
/// only by its own delay slot, not by any notion of object identity.
async fn run_retry_scheduler(
    mut incoming: mpsc::UnboundedReceiver<(WorkItem, Duration)>,
    work_tx: mpsc::Sender<WorkItem>,
    stats: Arc<RwLock<StageStats>>,
    cancel: CancellationToken,
) {
    use futures::StreamExt;
    let mut queue: DelayQueue<WorkItem> = DelayQueue::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            incoming_item = incoming.recv() => {
                match incoming_item {
                    Some((item, delay)) => { queue.insert(item, delay); }
                    None if queue.is_empty() => return,
                    None => {}
                }
            }
            expired = queue.next(), if !queue.is_empty() => {
                if let Some(Ok(expired)) = expired {
                    if work_tx.try_send(expired.into_inner()).is_err() {
                        stats.write().dropped_backpressure += 1;
                    }
                }
            }
        }
    }
}
