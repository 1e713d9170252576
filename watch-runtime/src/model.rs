//! Core data model shared by every stage of the watch pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A value found in a [`Resource`]'s `configuration` or `tags` maps.
///
/// Kept as a small closed enum (rather than `serde_json::Value`) so that
/// leaf comparisons in the diff algorithm stay exhaustive and cheap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<FieldValue>),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::String(s) => write!(f, "{s}"),
            FieldValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A resource snapshotted from a provider collector.
///
/// Opaque to the core beyond the fields used for identity and change
/// detection; `configuration` and `tags` are free-form maps owned by the
/// collector's domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configuration: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Resource {
    /// Deterministic fingerprint over the semantic fields.
    ///
    /// `configuration`/`tags` are `BTreeMap`s, so iteration is already
    /// key-sorted; hashing is stable under arbitrary construction order.
    pub fn fingerprint(&self) -> String {
        use std::hash::{Hash, Hasher};
        let mut hasher = ahash::AHasher::default();
        self.kind.hash(&mut hasher);
        self.name.hash(&mut hasher);
        self.namespace.hash(&mut hasher);
        self.region.hash(&mut hasher);
        for (k, v) in &self.configuration {
            k.hash(&mut hasher);
            v.to_string().hash(&mut hasher);
        }
        for (k, v) in &self.tags {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        format!("{:016x}", hasher.finish())
    }
}

/// An immutable point-in-time capture of a provider's resources.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub provider: String,
    pub timestamp: DateTime<Utc>,
    pub resources: Vec<Resource>,
}

/// The kind of change a [`WatchEvent`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Deleted,
    Modified,
}

/// The kind of mutation a single [`Change`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Added,
    Modified,
    Removed,
}

/// A single field-level difference between two versions of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
    pub change_type: ChangeOp,
}

/// A change observed (or derived) by the watch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub resource: Resource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<Change>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl WatchEvent {
    /// Metadata field read back as a correlation rule id, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// A condition operator usable in a [`CorrelationRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Neq,
    Contains,
    StartsWith,
    EndsWith,
}

/// A single predicate evaluated against a [`WatchEvent`] during correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
    pub value: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// A rule describing when events across providers should be correlated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRule {
    pub id: String,
    pub name: String,
    pub providers: Vec<String>,
    pub kinds: Vec<EventKind>,
    #[serde(with = "duration_secs")]
    pub window: std::time::Duration,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub enabled: bool,
}

impl CorrelationRule {
    /// `providers` matching every supported provider identifier.
    pub fn all_providers() -> Vec<String> {
        vec![
            "terraform".to_string(),
            "aws".to_string(),
            "gcp".to_string(),
            "kubernetes".to_string(),
        ]
    }

    pub fn all_kinds() -> Vec<EventKind> {
        vec![EventKind::Created, EventKind::Deleted, EventKind::Modified]
    }
}

/// Serializes a [`std::time::Duration`] as whole seconds, to keep rule
/// configuration files human-editable.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serializes a [`std::time::Duration`] as a single nanosecond count, per
/// spec §6's stats-surface wire format ("all durations in nanoseconds in
/// the wire form"). Used on the latency fields of the stats structs, as
/// opposed to [`duration_secs`]'s human-editable config-file format.
pub mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_nanos() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

/// A derived event grouping a primary [`WatchEvent`] with related history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatedEvent(pub WatchEvent);

/// An event wrapped with delivery-pipeline bookkeeping.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    pub original_event: WatchEvent,
    pub processed_at: DateTime<Utc>,
    pub processor_id: String,
    pub latency: std::time::Duration,
    pub enrichments: serde_json::Map<String, serde_json::Value>,
    pub priority: u8,
    pub tags: Vec<String>,
}

impl DeliveryEvent {
    pub fn new(original_event: WatchEvent) -> Self {
        Self {
            original_event,
            processed_at: Utc::now(),
            processor_id: String::new(),
            latency: std::time::Duration::ZERO,
            enrichments: serde_json::Map::new(),
            priority: 0,
            tags: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(config_pairs: &[(&str, &str)]) -> Resource {
        Resource {
            id: "A".into(),
            kind: "vm".into(),
            name: "x".into(),
            namespace: None,
            region: Some("us1".into()),
            configuration: config_pairs
                .iter()
                .map(|(k, v)| (k.to_string(), FieldValue::String(v.to_string())))
                .collect(),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn fingerprint_stable_under_construction_order() {
        let a = resource(&[("size", "small"), ("zone", "a")]);
        let mut b = resource(&[("zone", "a"), ("size", "small")]);
        // BTreeMap already sorts, but rebuild via a different insertion order
        // to make sure no hidden iteration-order dependency sneaks in.
        b.configuration = BTreeMap::new();
        b.configuration
            .insert("zone".into(), FieldValue::String("a".into()));
        b.configuration
            .insert("size".into(), FieldValue::String("small".into()));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_value() {
        let a = resource(&[("size", "small")]);
        let b = resource(&[("size", "large")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
