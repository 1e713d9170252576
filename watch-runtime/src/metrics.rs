//! Stats surfaces exposed by every component.
//!
//! All mutation happens behind the owning `parking_lot::RwLock`; readers
//! take a `.clone()`d snapshot rather than holding the lock across await
//! points, per spec §5 ("reader-preference... writers update counters,
//! readers take consistent snapshots").

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::model::duration_nanos;

/// Counters for a single [`crate::watcher::ProviderWatcher`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatcherStats {
    pub events_emitted: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub scan_count: u64,
    #[serde(with = "duration_nanos")]
    pub avg_scan_duration: Duration,
    pub error_count: u64,
    pub drops: u64,
}

/// Shared, lock-protected counters for a provider watcher.
#[derive(Debug, Default)]
pub struct WatcherStatsHandle(RwLock<WatcherStats>);

impl WatcherStatsHandle {
    pub fn snapshot(&self) -> WatcherStats {
        self.0.read().clone()
    }

    pub fn record_emitted(&self, at: DateTime<Utc>) {
        let mut s = self.0.write();
        s.events_emitted += 1;
        s.last_event_time = Some(at);
    }

    pub fn record_drop(&self) {
        self.0.write().drops += 1;
    }

    pub fn record_error(&self) {
        self.0.write().error_count += 1;
    }

    pub fn record_scan(&self, duration: Duration) {
        let mut s = self.0.write();
        let n = s.scan_count;
        // running average, avoids keeping a full history
        let prev_total = s.avg_scan_duration.as_secs_f64() * n as f64;
        s.scan_count += 1;
        s.avg_scan_duration = Duration::from_secs_f64((prev_total + duration.as_secs_f64()) / s.scan_count as f64);
    }
}

/// Per-source counters tracked by the [`crate::merger::EventMerger`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub forwarded: u64,
    pub drops: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    #[serde(with = "duration_nanos")]
    pub avg_forward_latency: Duration,
}

/// Aggregate merger stats snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergerStats {
    pub total_forwarded: u64,
    pub per_source: std::collections::HashMap<String, SourceStats>,
    pub buffer_utilization: f64,
}

/// Per-rule correlator counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrelatorStats {
    pub events_seen: u64,
    pub correlated_emitted: u64,
    pub per_rule_matches: std::collections::HashMap<String, u64>,
    pub history_len: usize,
}

/// Delivery pipeline stats, one stage-keyed map of counters plus circuit
/// state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub per_stage: std::collections::HashMap<String, StageStats>,
    pub circuit_state: Option<crate::pipeline::circuit::CircuitState>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageStats {
    pub processed: u64,
    pub retried: u64,
    pub errors: u64,
    pub dropped_backpressure: u64,
    #[serde(with = "duration_nanos")]
    pub avg_latency: Duration,
}

/// Aggregate snapshot across every component the controller owns.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    pub providers: std::collections::HashMap<String, WatcherStats>,
    pub merger: MergerStats,
    pub correlator: CorrelatorStats,
    pub pipeline: Option<PipelineStats>,
    pub last_refreshed: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // spec §6: "All durations in nanoseconds in the wire form" for the stats surface.
    #[test]
    fn latency_fields_serialize_as_bare_nanoseconds() {
        let stats = WatcherStats { avg_scan_duration: Duration::from_millis(250), ..Default::default() };
        let json: serde_json::Value = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["avg_scan_duration"], 250_000_000u64);
    }
}
