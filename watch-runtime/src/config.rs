//! The `Config` schema from spec §6, with `Default` impls giving the
//! documented defaults and synchronous validation for `Start`/`AddProvider`/
//! `UpdateConfig`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{duration_secs, CorrelationRule};
use crate::pipeline::backpressure::{BackpressureConfig, DropPolicy};
use crate::pipeline::circuit::CircuitConfig;
use crate::pipeline::retry::{BackoffKind, RetryPolicy};
use crate::pipeline::stage::StageConfig;

/// Per-provider, per-component configuration. Deserializable from TOML or
/// YAML; every field documented in spec §6 is represented here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub providers: Vec<String>,
    pub polling_intervals: HashMap<String, PollingInterval>,
    pub buffer_size: usize,
    pub correlation: CorrelationConfig,
    pub pipeline: PipelineSettings,
    pub backpressure: BackpressureSettings,
    pub circuit: CircuitSettings,
    pub regions: Vec<String>,
    pub namespaces: Vec<String>,
    pub resource_types: Vec<String>,
    pub incremental_scanning: bool,
    pub memory_optimization: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollingInterval(#[serde(with = "duration_secs")] pub Duration);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    #[serde(with = "duration_secs")]
    pub window_default: Duration,
    pub history_size: usize,
    pub rules: Vec<CorrelationRule>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_default: Duration::from_secs(5 * 60),
            history_size: 10_000,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub stages: Vec<StageSettings>,
}

/// The serializable half of a pipeline stage; pairs with a runtime-supplied
/// [`crate::pipeline::stage::StageProcessor`] to build a
/// [`crate::pipeline::StageSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    pub id: String,
    pub name: String,
    pub concurrency: usize,
    pub buffer: usize,
    #[serde(with = "duration_secs")]
    pub per_event_timeout: Duration,
    pub retry: RetrySettings,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl From<RetrySettings> for RetryPolicy {
    fn from(r: RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: r.max_attempts,
            backoff: r.backoff,
            initial_delay: r.initial_delay,
            max_delay: r.max_delay,
            multiplier: r.multiplier,
        }
    }
}

impl StageSettings {
    pub fn into_stage_config(self) -> StageConfig {
        StageConfig {
            id: self.id,
            name: self.name,
            concurrency: self.concurrency,
            buffer: self.buffer,
            per_event_timeout: self.per_event_timeout,
            retry_policy: self.retry.into(),
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureSettings {
    pub max_queue: usize,
    pub threshold: f64,
    pub drop_policy: DropPolicy,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self { max_queue: 1000, threshold: 0.8, drop_policy: DropPolicy::Newest }
    }
}

impl From<BackpressureSettings> for BackpressureConfig {
    fn from(b: BackpressureSettings) -> Self {
        BackpressureConfig { max_queue_size: b.max_queue, throttle_threshold: b.threshold, drop_policy: b.drop_policy }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    #[serde(with = "duration_secs")]
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(30), success_threshold: 3 }
    }
}

impl From<CircuitSettings> for CircuitConfig {
    fn from(c: CircuitSettings) -> Self {
        CircuitConfig {
            failure_threshold: c.failure_threshold,
            reset_timeout: c.reset_timeout,
            success_threshold: c.success_threshold,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut polling_intervals = HashMap::new();
        polling_intervals.insert("kubernetes".to_string(), PollingInterval(Duration::from_secs(15)));
        Self {
            providers: Vec::new(),
            polling_intervals,
            buffer_size: 1000,
            correlation: CorrelationConfig::default(),
            pipeline: PipelineSettings::default(),
            backpressure: BackpressureSettings::default(),
            circuit: CircuitSettings::default(),
            regions: Vec::new(),
            namespaces: Vec::new(),
            resource_types: Vec::new(),
            incremental_scanning: false,
            memory_optimization: false,
        }
    }
}

const SUPPORTED_PROVIDERS: &[&str] = &["terraform", "aws", "gcp", "kubernetes"];

/// Default polling interval for any provider not listed in
/// `polling_intervals` — 60s, overridden to 15s for kubernetes via
/// [`Config::default`]'s seeded map entry.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);

impl Config {
    pub fn polling_interval_for(&self, provider: &str) -> Duration {
        self.polling_intervals.get(provider).map(|p| p.0).unwrap_or(DEFAULT_POLLING_INTERVAL)
    }

    /// Validates the whole config. Called synchronously from
    /// `Controller::start`/`add_provider`/`update_config`; never from a
    /// running loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::EmptyBuffer);
        }
        for provider in &self.providers {
            if !SUPPORTED_PROVIDERS.contains(&provider.as_str()) {
                return Err(ConfigError::UnknownProvider(provider.clone()));
            }
        }
        for (provider, interval) in &self.polling_intervals {
            if interval.0.is_zero() {
                return Err(ConfigError::NonPositiveInterval {
                    provider: provider.clone(),
                    millis: 0,
                });
            }
        }
        for rule in &self.correlation.rules {
            if rule.providers.is_empty() {
                return Err(ConfigError::EmptyRuleProviders(rule.id.clone()));
            }
            if rule.window.is_zero() {
                return Err(ConfigError::ZeroWindowRule(rule.id.clone()));
            }
        }
        for stage in &self.pipeline.stages {
            if stage.concurrency == 0 {
                return Err(ConfigError::ZeroConcurrency(stage.id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.buffer_size, 1000);
        assert_eq!(config.polling_interval_for("aws"), Duration::from_secs(60));
        assert_eq!(config.polling_interval_for("kubernetes"), Duration::from_secs(15));
        assert_eq!(config.correlation.history_size, 10_000);
    }

    #[test]
    fn rejects_unknown_provider() {
        let mut config = Config::default();
        config.providers.push("openstack".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::UnknownProvider(_))));
    }

    #[test]
    fn rejects_zero_buffer() {
        let mut config = Config::default();
        config.buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::EmptyBuffer)));
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.buffer_size, config.buffer_size);
    }
}
