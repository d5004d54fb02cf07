//! nodefleet.toml configuration parser.
//!
//! Every section and field has a default, so an empty file yields a
//! working configuration for a 2..10 node cluster. Durations are kept as
//! strings (`"5m"`) and resolved through accessor methods.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::schedule::{ThresholdSchedule, ThresholdSet, ThresholdWindow};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub cluster: ClusterConfig,
    pub thresholds: ThresholdSet,
    pub threshold_schedule: Vec<ThresholdWindow>,
    pub cooldown: CooldownConfig,
    pub sustained: SustainedConfig,
    pub lock: LockConfig,
    pub metrics: MetricsConfig,
    pub predictive: PredictiveConfig,
    pub placement: PlacementConfig,
    pub lifecycle: LifecycleConfig,
    pub notify: NotifyConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub id: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// redb file holding cluster state.
    pub state_path: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: "node-fleet-cluster".to_string(),
            min_nodes: 2,
            max_nodes: 10,
            state_path: "/var/lib/nodefleet/state.redb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CooldownConfig {
    pub scale_up: String,
    pub scale_down: String,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            scale_up: "5m".to_string(),
            scale_down: "10m".to_string(),
        }
    }
}

impl CooldownConfig {
    pub fn scale_up_duration(&self) -> Duration {
        duration_or(&self.scale_up, 300)
    }

    pub fn scale_down_duration(&self) -> Duration {
        duration_or(&self.scale_down, 600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SustainedConfig {
    /// Consecutive readings (current included) required before scaling up.
    pub scale_up_readings: usize,
    /// Consecutive readings (current included) required before scaling down.
    pub scale_down_readings: usize,
    /// Capacity of the bounded metrics history kept in cluster state.
    pub history_capacity: usize,
}

impl Default for SustainedConfig {
    fn default() -> Self {
        Self {
            scale_up_readings: 2,
            scale_down_readings: 5,
            history_capacity: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub ttl: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: "10m".to_string(),
        }
    }
}

impl LockConfig {
    pub fn ttl_duration(&self) -> Duration {
        duration_or(&self.ttl, 600)
    }

    /// Deadline for the work done under the lock: nine tenths of the TTL,
    /// so a cycle gives up before its lock can be recovered as stale.
    pub fn cycle_deadline(&self) -> Duration {
        self.ttl_duration() * 9 / 10
    }
}

/// A custom application signal: PromQL expression plus scale-up limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomMetricConfig {
    pub name: String,
    pub query: String,
    pub limit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub prometheus_url: String,
    pub query_timeout: String,
    pub retries: u32,
    pub retry_backoff: String,
    /// Maximum age of a cached snapshot that may stand in for a failed collection.
    pub staleness: String,
    /// Consecutive failed collections before the cluster counts as unreachable.
    pub max_consecutive_failures: u32,
    /// Overrides for the built-in queries, keyed by signal name.
    pub queries: BTreeMap<String, String>,
    pub custom: Vec<CustomMetricConfig>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_url: "http://127.0.0.1:9090".to_string(),
            query_timeout: "10s".to_string(),
            retries: 2,
            retry_backoff: "2s".to_string(),
            staleness: "10m".to_string(),
            max_consecutive_failures: 3,
            queries: BTreeMap::new(),
            custom: Vec::new(),
        }
    }
}

impl MetricsConfig {
    pub fn query_timeout_duration(&self) -> Duration {
        duration_or(&self.query_timeout, 10)
    }

    pub fn retry_backoff_duration(&self) -> Duration {
        duration_or(&self.retry_backoff, 2)
    }

    pub fn staleness_duration(&self) -> Duration {
        duration_or(&self.staleness, 600)
    }

    /// Custom signal limits keyed by name.
    pub fn custom_limits(&self) -> BTreeMap<String, f64> {
        self.custom
            .iter()
            .map(|c| (c.name.clone(), c.limit))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PredictiveConfig {
    pub enabled: bool,
    /// Late-hour window during which the forecast is consulted.
    pub window: String,
    pub lookback_days: u32,
    /// Minimum archived samples in the target hour before trusting the average.
    pub min_samples: usize,
    /// How long archived snapshots are kept.
    pub archive_retention: String,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: "10m".to_string(),
            lookback_days: 7,
            min_samples: 3,
            archive_retention: "30d".to_string(),
        }
    }
}

impl PredictiveConfig {
    pub fn window_minutes(&self) -> u32 {
        (duration_or(&self.window, 600).as_secs() / 60).min(60) as u32
    }

    pub fn archive_retention_duration(&self) -> Duration {
        duration_or(&self.archive_retention, 30 * 86_400)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlacementConfig {
    pub zones: Vec<String>,
    /// Target share of spot capacity (0.0-1.0).
    pub spot_ratio: f64,
    pub spot_template: String,
    pub on_demand_template: String,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            zones: vec!["zone-a".to_string(), "zone-b".to_string()],
            spot_ratio: 0.7,
            spot_template: "worker-spot".to_string(),
            on_demand_template: "worker-on-demand".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    pub ready_timeout: String,
    pub ready_poll_interval: String,
    pub drain_timeout: String,
    /// Retries for throttled launch calls.
    pub launch_retries: u32,
    pub launch_backoff: String,
    /// Drain and replace spot nodes that carry a reclaim notice.
    pub handle_spot_interruptions: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ready_timeout: "300s".to_string(),
            ready_poll_interval: "10s".to_string(),
            drain_timeout: "300s".to_string(),
            launch_retries: 2,
            launch_backoff: "2s".to_string(),
            handle_spot_interruptions: true,
        }
    }
}

impl LifecycleConfig {
    pub fn ready_timeout_duration(&self) -> Duration {
        duration_or(&self.ready_timeout, 300)
    }

    pub fn ready_poll_interval_duration(&self) -> Duration {
        duration_or(&self.ready_poll_interval, 10)
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        duration_or(&self.drain_timeout, 300)
    }

    pub fn launch_backoff_duration(&self) -> Duration {
        duration_or(&self.launch_backoff, 2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving JSON scaling events. Events are only logged when unset.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval: String,
    /// Shorten or stretch the interval based on recent scaling activity.
    pub adaptive: bool,
    pub min_interval: String,
    pub max_interval: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: "2m".to_string(),
            adaptive: false,
            min_interval: "1m".to_string(),
            max_interval: "5m".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval_duration(&self) -> Duration {
        duration_or(&self.interval, 120)
    }

    pub fn min_interval_duration(&self) -> Duration {
        duration_or(&self.min_interval, 60)
    }

    pub fn max_interval_duration(&self) -> Duration {
        duration_or(&self.max_interval, 300)
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a starter configuration for a cluster.
    pub fn scaffold(cluster_id: &str, prometheus_url: &str) -> Self {
        let mut config = FleetConfig::default();
        config.cluster.id = cluster_id.to_string();
        config.metrics.prometheus_url = prometheus_url.to_string();
        config.metrics.custom = vec![
            CustomMetricConfig {
                name: "queue_depth".to_string(),
                query: "sum(app_queue_depth)".to_string(),
                limit: 1000.0,
            },
            CustomMetricConfig {
                name: "latency_p95_ms".to_string(),
                query: "histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket[5m])) by (le)) * 1000".to_string(),
                limit: 2000.0,
            },
        ];
        config
    }

    /// Longest a cycle can legitimately take: the collection retries plus
    /// the slower of a scale-up (launch retries and ready wait) and a
    /// scale-down (drain).
    pub fn cycle_budget(&self) -> Duration {
        let m = &self.metrics;
        let collect = m.query_timeout_duration() * (m.retries + 1) + m.retry_backoff_duration() * m.retries;
        let l = &self.lifecycle;
        let scale_up = l.ready_timeout_duration() + l.launch_backoff_duration() * l.launch_retries;
        collect + scale_up.max(l.drain_timeout_duration())
    }

    pub fn threshold_schedule(&self) -> ThresholdSchedule {
        ThresholdSchedule::new(self.thresholds.clone(), self.threshold_schedule.clone())
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.cluster.id.trim().is_empty() {
            return invalid("cluster.id must not be empty".to_string());
        }
        if self.cluster.min_nodes > self.cluster.max_nodes {
            return invalid(format!(
                "cluster.min_nodes ({}) exceeds cluster.max_nodes ({})",
                self.cluster.min_nodes, self.cluster.max_nodes
            ));
        }

        let mut sets = vec![self.thresholds.clone()];
        sets.extend(
            self.threshold_schedule
                .iter()
                .map(|w| self.threshold_schedule().for_hour(w.start_hour)),
        );
        for t in &sets {
            for (name, v) in [
                ("cpu_up", t.cpu_up),
                ("cpu_down", t.cpu_down),
                ("memory_up", t.memory_up),
                ("memory_down", t.memory_down),
                ("extreme_cpu", t.extreme_cpu),
            ] {
                if !(0.0..=100.0).contains(&v) {
                    return invalid(format!("threshold {name} = {v} is outside 0..=100"));
                }
            }
            if t.cpu_down >= t.cpu_up {
                return invalid("cpu_down must be below cpu_up".to_string());
            }
            if t.memory_down >= t.memory_up {
                return invalid("memory_down must be below memory_up".to_string());
            }
        }
        for w in &self.threshold_schedule {
            if w.start_hour > 23 || w.end_hour > 24 {
                return invalid(format!(
                    "threshold window {}..{} has an hour out of range",
                    w.start_hour, w.end_hour
                ));
            }
        }

        let s = &self.sustained;
        if s.scale_up_readings == 0 || s.scale_down_readings == 0 {
            return invalid("sustained reading windows must be at least 1".to_string());
        }
        if s.history_capacity < s.scale_up_readings.max(s.scale_down_readings) {
            return invalid(format!(
                "sustained.history_capacity ({}) is smaller than the longest sustained window",
                s.history_capacity
            ));
        }

        if !(0.0..=1.0).contains(&self.placement.spot_ratio) {
            return invalid(format!(
                "placement.spot_ratio = {} is outside 0..=1",
                self.placement.spot_ratio
            ));
        }
        if self.placement.zones.is_empty() {
            return invalid("placement.zones must list at least one zone".to_string());
        }

        for (field, value) in [
            ("cooldown.scale_up", &self.cooldown.scale_up),
            ("cooldown.scale_down", &self.cooldown.scale_down),
            ("lock.ttl", &self.lock.ttl),
            ("metrics.query_timeout", &self.metrics.query_timeout),
            ("metrics.retry_backoff", &self.metrics.retry_backoff),
            ("metrics.staleness", &self.metrics.staleness),
            ("predictive.window", &self.predictive.window),
            ("predictive.archive_retention", &self.predictive.archive_retention),
            ("lifecycle.ready_timeout", &self.lifecycle.ready_timeout),
            ("lifecycle.ready_poll_interval", &self.lifecycle.ready_poll_interval),
            ("lifecycle.drain_timeout", &self.lifecycle.drain_timeout),
            ("lifecycle.launch_backoff", &self.lifecycle.launch_backoff),
            ("schedule.interval", &self.schedule.interval),
            ("schedule.min_interval", &self.schedule.min_interval),
            ("schedule.max_interval", &self.schedule.max_interval),
        ] {
            if parse_duration(value).is_none() {
                return invalid(format!("{field} = {value:?} is not a duration"));
            }
        }

        let budget = self.cycle_budget();
        if budget > self.lock.cycle_deadline() {
            return invalid(format!(
                "lock.ttl = {:?} is too short: a cycle may take {}s, which must fit within nine tenths of the ttl",
                self.lock.ttl,
                budget.as_secs()
            ));
        }

        Ok(())
    }
}

fn duration_or(s: &str, default_secs: u64) -> Duration {
    parse_duration(s).unwrap_or(Duration::from_secs(default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config.cluster.min_nodes, 2);
        assert_eq!(config.cluster.max_nodes, 10);
        assert_eq!(config.thresholds.cpu_up, 70.0);
        assert_eq!(config.cooldown.scale_up_duration(), Duration::from_secs(300));
        assert_eq!(config.cooldown.scale_down_duration(), Duration::from_secs(600));
        assert_eq!(config.sustained.scale_up_readings, 2);
        assert_eq!(config.sustained.scale_down_readings, 5);
        assert_eq!(config.lock.ttl_duration(), Duration::from_secs(600));
        assert_eq!(config.lifecycle.drain_timeout_duration(), Duration::from_secs(300));
        assert_eq!(config.metrics.max_consecutive_failures, 3);
        assert_eq!(config.predictive.window_minutes(), 10);
    }

    #[test]
    fn parse_partial_sections() {
        let config = FleetConfig::from_toml_str(
            r#"
[cluster]
id = "prod"
min_nodes = 3
max_nodes = 12

[thresholds]
cpu_up = 65.0

[[threshold_schedule]]
start_hour = 9
end_hour = 18
cpu_up = 55.0

[[metrics.custom]]
name = "queue_depth"
query = "sum(app_queue_depth)"
limit = 500.0
"#,
        )
        .unwrap();

        assert_eq!(config.cluster.id, "prod");
        assert_eq!(config.cluster.min_nodes, 3);
        assert_eq!(config.thresholds.cpu_up, 65.0);
        assert_eq!(config.thresholds.memory_up, 75.0);
        assert_eq!(config.threshold_schedule().for_hour(10).cpu_up, 55.0);
        assert_eq!(config.threshold_schedule().for_hour(20).cpu_up, 65.0);
        assert_eq!(config.metrics.custom_limits().get("queue_depth"), Some(&500.0));
    }

    #[test]
    fn scaffold_round_trips_through_toml() {
        let config = FleetConfig::scaffold("staging", "http://prom:9090");
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("staging"));

        let parsed = FleetConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn rejects_min_above_max() {
        let err = FleetConfig::from_toml_str("[cluster]\nmin_nodes = 5\nmax_nodes = 3\n").unwrap_err();
        assert!(err.to_string().contains("min_nodes"));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = FleetConfig::from_toml_str("[thresholds]\ncpu_up = 20.0\n").unwrap_err();
        assert!(err.to_string().contains("cpu_down"));
    }

    #[test]
    fn rejects_history_shorter_than_window() {
        let err = FleetConfig::from_toml_str("[sustained]\nhistory_capacity = 3\n").unwrap_err();
        assert!(err.to_string().contains("history_capacity"));
    }

    #[test]
    fn rejects_bad_duration() {
        let err = FleetConfig::from_toml_str("[lock]\nttl = \"forever\"\n").unwrap_err();
        assert!(err.to_string().contains("lock.ttl"));
    }

    #[test]
    fn default_cycle_fits_within_lock_ttl() {
        let config = FleetConfig::default();
        // 3 x 10s queries + 2 x 2s backoff, then 300s ready wait + 2 x 2s launch backoff.
        assert_eq!(config.cycle_budget(), Duration::from_secs(338));
        assert_eq!(config.lock.cycle_deadline(), Duration::from_secs(540));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_lock_ttl_shorter_than_cycle() {
        let err = FleetConfig::from_toml_str("[lock]\nttl = \"300s\"\n").unwrap_err();
        assert!(err.to_string().contains("lock.ttl"));

        let err = FleetConfig::from_toml_str(
            "[lock]\nttl = \"10m\"\n\n[lifecycle]\ndrain_timeout = \"9m\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn rejects_spot_ratio_out_of_range() {
        let err = FleetConfig::from_toml_str("[placement]\nspot_ratio = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("spot_ratio"));
    }
}
