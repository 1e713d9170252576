//! Priority-ordered routing of an incoming event to a target stage group.

use crate::model::{ConditionOp, WatchEvent};

/// A single routing predicate. Reuses the correlator's field selectors and
/// operators so a router rule and a correlation rule read the same way.
#[derive(Debug, Clone)]
pub struct RouteCondition {
    pub field: String,
    pub op: ConditionOp,
    pub value: String,
    pub case_sensitive: bool,
}

/// One entry in the router's priority-ordered rule list.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub name: String,
    pub conditions: Vec<RouteCondition>,
    pub target_group: String,
}

/// Routes events to a named stage group, falling back to `default_group` on
/// no match. Rules are evaluated in list order; the first full match wins.
#[derive(Debug, Clone)]
pub struct EventRouter {
    rules: Vec<RouteRule>,
    default_group: String,
}

impl EventRouter {
    pub fn new(default_group: impl Into<String>) -> Self {
        Self { rules: Vec::new(), default_group: default_group.into() }
    }

    pub fn with_rule(mut self, rule: RouteRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn route(&self, event: &WatchEvent) -> &str {
        for rule in &self.rules {
            if rule.conditions.iter().all(|c| evaluate(c, event)) {
                return &rule.target_group;
            }
        }
        &self.default_group
    }
}

fn evaluate(condition: &RouteCondition, event: &WatchEvent) -> bool {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, Resource};
    use std::collections::BTreeMap;

    fn event(provider: &str) -> WatchEvent {
        WatchEvent {
            id: "e1".into(),
            kind: EventKind::Created,
            timestamp: chrono::Utc::now(),
            provider: provider.into(),
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

    #[test]
    fn first_matching_rule_wins() {
        let router = EventRouter::new("default")
            .with_rule(RouteRule {
                name: "aws-only".into(),
                conditions: vec![RouteCondition {
                    field: "provider".into(),
                    op: ConditionOp::Eq,
                    value: "aws".into(),
                    case_sensitive: true,
                }],
                target_group: "aws-group".into(),
            })
            .with_rule(RouteRule {
                name: "catch-all".into(),
                conditions: vec![],
                target_group: "everything".into(),
            });

        assert_eq!(router.route(&event("aws")), "aws-group");
        assert_eq!(router.route(&event("gcp")), "everything");
    }

    #[test]
    fn falls_back_to_default_group_on_no_match() {
        let router = EventRouter::new("default").with_rule(RouteRule {
            name: "aws-only".into(),
            conditions: vec![RouteCondition {
                field: "provider".into(),
                op: ConditionOp::Eq,
                value: "aws".into(),
                case_sensitive: true,
            }],
            target_group: "aws-group".into(),
        });
        assert_eq!(router.route(&event("gcp")), "default");
    }
}
