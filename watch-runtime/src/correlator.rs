//! Cross-provider correlation: groups semantically related events across
//! providers by temporal proximity and resource-identity overlap.
//!
//! The correlator is a single-reader component: `process_event` serializes
//! all history mutation behind one internal mutex (REDESIGN FLAGS calls for
//! an arena-plus-index model rather than a pointer graph between history and
//! rules — history here is an append-only ring, rules reference events only
//! by id).

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::instrument;

use crate::model::{ConditionOp, CorrelatedEvent, CorrelationRule, EventKind, WatchEvent};

const DEFAULT_HISTORY_CAP: usize = 10_000;

#[derive(Debug, Default)]
struct Counters {
    events_seen: u64,
    correlated_emitted: u64,
    per_rule_matches: std::collections::HashMap<String, u64>,
}

/// Evaluates [`CorrelationRule`]s against a rolling history of events.
#[derive(Debug)]
pub struct Correlator {
    rules: RwLock<Vec<CorrelationRule>>,
    history: Mutex<VecDeque<WatchEvent>>,
    history_cap: usize,
    counters: RwLock<Counters>,
}

impl Correlator {
    pub fn new(history_cap: usize) -> Self {
        Self {
            rules: RwLock::new(default_rules()),
            history: Mutex::new(VecDeque::new()),
            history_cap: history_cap.max(1),
            counters: RwLock::new(Counters::default()),
        }
    }

    pub fn with_rules(rules: Vec<CorrelationRule>, history_cap: usize) -> Self {
        Self {
            rules: RwLock::new(rules),
            history: Mutex::new(VecDeque::new()),
            history_cap: history_cap.max(1),
            counters: RwLock::new(Counters::default()),
        }
    }

    pub fn add_rule(&self, rule: CorrelationRule) {
        self.rules.write().push(rule);
    }

    pub fn remove_rule(&self, id: &str) {
        self.rules.write().retain(|r| r.id != id);
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) {
        if let Some(rule) = self.rules.write().iter_mut().find(|r| r.id == id) {
            rule.enabled = enabled;
        }
    }

    pub fn rules(&self) -> Vec<CorrelationRule> {
        self.rules.read().clone()
    }

    /// Evaluates every enabled rule against `event`, returning zero or more
    /// derived [`CorrelatedEvent`]s, then appends `event` to history.
    ///
    /// Matching never considers `event` itself a candidate for its own
    /// correlation: it is pushed into history only after matching completes.
    #[instrument(skip(self, event), fields(provider = %event.provider, event_id = %event.id))]
    pub fn process_event(&self, event: &WatchEvent) -> Vec<CorrelatedEvent> {
        self.counters.write().events_seen += 1;

        let rules = self.rules.read();
        let max_window = rules.iter().map(|r| r.window).max().unwrap_or(Duration::ZERO);
        let mut history = self.history.lock();
        evict_stale(&mut history, event.timestamp, max_window);

        let mut correlated = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            if !rule_matches_event(rule, event) {
                continue;
            }
            let related: Vec<&WatchEvent> = history
                .iter()
                .filter(|c| {
                    c.id != event.id
                        && duration_between(c.timestamp, event.timestamp) <= rule.window
                        && related_by_identity(c, event)
                })
                .collect();
            if related.is_empty() {
                continue;
            }

            let confidence = confidence_score(&related, event);
            let related_ids: Vec<String> = related.iter().map(|c| c.id.clone()).collect();

            let mut metadata = serde_json::Map::new();
            metadata.insert("rule_id".to_string(), serde_json::Value::String(rule.id.clone()));
            metadata.insert("primary_event_id".to_string(), serde_json::Value::String(event.id.clone()));
            metadata.insert(
                "related_event_ids".to_string(),
                serde_json::Value::Array(related_ids.iter().cloned().map(serde_json::Value::String).collect()),
            );
            metadata.insert(
                "confidence".to_string(),
                serde_json::Number::from_f64(confidence).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
            );

            let mut derived = event.clone();
            derived.id = format!("correlated-{}-{}", rule.id, event.id);
            derived.provider = "correlator".to_string();
            derived.metadata = metadata;

            self.counters.write().correlated_emitted += 1;
            *self.counters.write().per_rule_matches.entry(rule.id.clone()).or_insert(0) += 1;

            correlated.push(CorrelatedEvent(derived));
        }

        history.push_back(event.clone());
        if history.len() > self.history_cap {
            history.pop_front();
        }

        correlated
    }

    pub fn stats(&self) -> crate::metrics::CorrelatorStats {
        let counters = self.counters.read();
        crate::metrics::CorrelatorStats {
            events_seen: counters.events_seen,
            correlated_emitted: counters.correlated_emitted,
            per_rule_matches: counters.per_rule_matches.clone(),
            history_len: self.history.lock().len(),
        }
    }
}

fn duration_between(a: chrono::DateTime<chrono::Utc>, b: chrono::DateTime<chrono::Utc>) -> Duration {
    (a - b).abs().to_std().unwrap_or(Duration::ZERO)
}

fn evict_stale(history: &mut VecDeque<WatchEvent>, now: chrono::DateTime<chrono::Utc>, max_window: Duration) {
    let max_age = max_window.saturating_mul(2);
    while let Some(front) = history.front() {
        if duration_between(front.timestamp, now) > max_age {
            history.pop_front();
        } else {
            break;
        }
    }
}

/// Step 2's relation test: same resource id; same `(type, name)`; same
/// non-empty namespace; same non-empty region.
fn related_by_identity(a: &WatchEvent, b: &WatchEvent) -> bool {
    if a.resource.id == b.resource.id {
        return true;
    }
    if a.resource.kind == b.resource.kind && a.resource.name == b.resource.name {
        return true;
    }
    if let (Some(an), Some(bn)) = (&a.resource.namespace, &b.resource.namespace) {
        if !an.is_empty() && an == bn {
            return true;
        }
    }
    if let (Some(ar), Some(br)) = (&a.resource.region, &b.resource.region) {
        if !ar.is_empty() && ar == br {
            return true;
        }
    }
    false
}

fn confidence_score(related: &[&WatchEvent], primary: &WatchEvent) -> f64 {
    let related_count = related.len() as f64;
    let distinct_providers = related.iter().map(|e| e.provider.as_str()).collect::<std::collections::HashSet<_>>().len() as f64;
    let within_60s = related
        .iter()
        .filter(|e| duration_between(e.timestamp, primary.timestamp) <= Duration::from_secs(60))
        .count() as f64;

    let score = 0.5 + 0.1 * related_count + 0.15 * (distinct_providers - 1.0) + 0.1 * within_60s;
    score.min(1.0)
}

fn rule_matches_event(rule: &CorrelationRule, event: &WatchEvent) -> bool {
    if !rule.providers.iter().any(|p| p == &event.provider) {
        return false;
    }
    if !rule.kinds.contains(&event.kind) {
        return false;
    }
    rule.conditions.iter().all(|c| evaluate_condition(c, event))
}

fn evaluate_condition(condition: &crate::model::Condition, event: &WatchEvent) -> bool {
    let Some(actual) = field_value(event, &condition.field) else {
        return false;
    };

    match condition.op {
        ConditionOp::Eq => actual == condition.value,
        ConditionOp::Neq => actual != condition.value,
        ConditionOp::Contains | ConditionOp::StartsWith | ConditionOp::EndsWith => {
            let (a, v) = if condition.case_sensitive {
                (actual, condition.value.clone())
            } else {
                (actual.to_lowercase(), condition.value.to_lowercase())
            };
            match condition.op {
                ConditionOp::Contains => a.contains(&v),
                ConditionOp::StartsWith => a.starts_with(&v),
                ConditionOp::EndsWith => a.ends_with(&v),
                _ => unreachable!(),
            }
        }
    }
}

fn field_value(event: &WatchEvent, field: &str) -> Option<String> {
    match field {
        "provider" => Some(event.provider.clone()),
        "kind" => Some(format!("{:?}", event.kind).to_lowercase()),
        "resource.type" => Some(event.resource.kind.clone()),
        "resource.name" => Some(event.resource.name.clone()),
        "resource.namespace" => event.resource.namespace.clone(),
        "resource.region" => event.resource.region.clone(),
        other => other
            .strip_prefix("configuration.")
            .and_then(|key| event.resource.configuration.get(key))
            .map(|v| v.to_string()),
    }
}

/// The three rules that ship preconfigured and enabled. Their `conditions`
/// lists are empty: `Condition` can only test the incoming event against a
/// literal value, it cannot express "match the candidate's field" — the
/// per-rule relation dimension (name / namespace / region) is which axis of
/// `related_by_identity` typically drives a match for that provider set, not
/// a literal predicate. See DESIGN.md for this decision.
fn default_rules() -> Vec<CorrelationRule> {
    vec![
        CorrelationRule {
            id: "cross-provider-resource".to_string(),
            name: "Cross-provider resource correlation".to_string(),
            providers: CorrelationRule::all_providers(),
            kinds: CorrelationRule::all_kinds(),
            window: Duration::from_secs(5 * 60),
            conditions: Vec::new(),
            enabled: true,
        },
        CorrelationRule {
            id: "kubernetes-namespace".to_string(),
            name: "Kubernetes namespace correlation".to_string(),
            providers: vec!["kubernetes".to_string()],
            kinds: CorrelationRule::all_kinds(),
            window: Duration::from_secs(2 * 60),
            conditions: Vec::new(),
            enabled: true,
        },
        CorrelationRule {
            id: "cloud-region".to_string(),
            name: "Cloud region correlation".to_string(),
            providers: vec!["aws".to_string(), "gcp".to_string()],
            kinds: CorrelationRule::all_kinds(),
            window: Duration::from_secs(10 * 60),
            conditions: Vec::new(),
            enabled: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resource;
    use std::collections::BTreeMap;

    fn event(id: &str, provider: &str, name: &str, region: Option<&str>, timestamp: chrono::DateTime<chrono::Utc>) -> WatchEvent {
        WatchEvent {
            id: id.to_string(),
            kind: EventKind::Modified,
            timestamp,
            provider: provider.to_string(),
            resource: Resource {
                id: format!("{provider}-{name}"),
                kind: "resource".to_string(),
                name: name.to_string(),
                namespace: None,
                region: region.map(str::to_string),
                configuration: BTreeMap::new(),
                tags: BTreeMap::new(),
            },
            previous_hash: None,
            current_hash: None,
            changes: None,
            metadata: Default::default(),
        }
    }

    // S4: cross-provider correlation via shared region within the default window.
    #[test]
    fn cross_provider_correlation_by_region() {
        let correlator = Correlator::new(DEFAULT_HISTORY_CAP);
        let t0 = chrono::Utc::now();
        let aws_event = event("aws-1", "aws", "web", Some("us1"), t0);
        assert!(correlator.process_event(&aws_event).is_empty());

        let gcp_event = event("gcp-1", "gcp", "web", Some("us1"), t0 + chrono::Duration::seconds(30));
        let correlated = correlator.process_event(&gcp_event);
        assert_eq!(correlated.len(), 1);
        let meta = &correlated[0].0.metadata;
        assert_eq!(meta.get("rule_id").unwrap(), "cross-provider-resource");
        let related_ids = meta.get("related_event_ids").unwrap().as_array().unwrap();
        assert!(related_ids.iter().any(|v| v == "aws-1"));
        let confidence = meta.get("confidence").unwrap().as_f64().unwrap();
        assert!(confidence >= 0.65, "confidence was {confidence}");
    }

    #[test]
    fn unrelated_events_do_not_correlate() {
        let correlator = Correlator::new(DEFAULT_HISTORY_CAP);
        let t0 = chrono::Utc::now();
        correlator.process_event(&event("aws-1", "aws", "web", Some("us1"), t0));
        let unrelated = event("gcp-1", "gcp", "db", Some("us2"), t0 + chrono::Duration::seconds(5));
        assert!(correlator.process_event(&unrelated).is_empty());
    }

    // P5: deterministic output for a fixed history + rules + input sequence.
    #[test]
    fn correlation_is_deterministic() {
        let run = || {
            let correlator = Correlator::new(DEFAULT_HISTORY_CAP);
            let t0 = chrono::Utc::now();
            correlator.process_event(&event("aws-1", "aws", "web", Some("us1"), t0));
            correlator
                .process_event(&event("gcp-1", "gcp", "web", Some("us1"), t0 + chrono::Duration::seconds(10)))
                .into_iter()
                .map(|c| c.0.metadata.get("confidence").unwrap().as_f64().unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn zero_window_correlates_only_exact_timestamp_peers() {
        let mut rule = default_rules().into_iter().next().unwrap();
        rule.window = Duration::ZERO;
        let correlator = Correlator::with_rules(vec![rule], DEFAULT_HISTORY_CAP);
        let t0 = chrono::Utc::now();
        correlator.process_event(&event("aws-1", "aws", "web", Some("us1"), t0));
        let later = event("gcp-1", "gcp", "web", Some("us1"), t0 + chrono::Duration::seconds(1));
        assert!(correlator.process_event(&later).is_empty());
        let exact = event("gcp-2", "gcp", "web", Some("us1"), t0);
        assert_eq!(correlator.process_event(&exact).len(), 1);
    }

    #[test]
    fn contains_condition_is_substring_match() {
        let condition = crate::model::Condition {
            field: "resource.name".to_string(),
            op: ConditionOp::Contains,
            value: "eb".to_string(),
            case_sensitive: true,
        };
        let e = event("a", "aws", "web", None, chrono::Utc::now());
        assert!(evaluate_condition(&condition, &e));
    }
}
