//! Cluster metrics collector.
//!
//! Runs the four core queries concurrently, each under its own timeout and
//! retry budget, then the configured custom signals. The core queries are
//! all-or-nothing; a custom signal that fails is left out of the snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use nodefleet_core::config::MetricsConfig;
use nodefleet_state::MetricsSnapshot;

use crate::error::{MetricsError, MetricsErrorKind, MetricsResult};
use crate::source::MetricsSource;

pub const CPU_QUERY: &str = r#"avg(rate(node_cpu_seconds_total{mode!="idle"}[5m])) * 100"#;
pub const MEMORY_QUERY: &str =
    r#"(1 - avg(node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes)) * 100"#;
pub const PENDING_QUERY: &str = r#"sum(kube_pod_status_unschedulable)"#;
pub const READY_NODES_QUERY: &str = r#"sum(kube_node_status_condition{condition="Ready",status="true"})"#;

/// Expressions for the four core signals.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySet {
    pub cpu: String,
    pub memory: String,
    pub pending: String,
    pub ready_nodes: String,
}

impl Default for QuerySet {
    fn default() -> Self {
        Self {
            cpu: CPU_QUERY.to_string(),
            memory: MEMORY_QUERY.to_string(),
            pending: PENDING_QUERY.to_string(),
            ready_nodes: READY_NODES_QUERY.to_string(),
        }
    }
}

impl QuerySet {
    /// Defaults with per-signal overrides keyed `cpu`, `memory`, `pending`,
    /// `ready_nodes`. Unknown keys are ignored.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut set = Self::default();
        for (name, expr) in overrides {
            match name.as_str() {
                "cpu" => set.cpu = expr.clone(),
                "memory" => set.memory = expr.clone(),
                "pending" => set.pending = expr.clone(),
                "ready_nodes" => set.ready_nodes = expr.clone(),
                other => warn!(signal = %other, "ignoring override for unknown signal"),
            }
        }
        set
    }
}

/// An application signal queried alongside the core set.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomQuery {
    pub name: String,
    pub expr: String,
}

/// Collects a [`MetricsSnapshot`] from a [`MetricsSource`].
pub struct MetricsCollector {
    source: Arc<dyn MetricsSource>,
    queries: QuerySet,
    custom: Vec<CustomQuery>,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl MetricsCollector {
    /// Create a collector with default queries, 10s timeout and 2 retries
    /// 2s apart.
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self {
            source,
            queries: QuerySet::default(),
            custom: Vec::new(),
            timeout: Duration::from_secs(10),
            retries: 2,
            backoff: Duration::from_secs(2),
        }
    }

    pub fn from_config(source: Arc<dyn MetricsSource>, config: &MetricsConfig) -> Self {
        Self {
            source,
            queries: QuerySet::with_overrides(&config.queries),
            custom: config
                .custom
                .iter()
                .map(|c| CustomQuery {
                    name: c.name.clone(),
                    expr: c.query.clone(),
                })
                .collect(),
            timeout: config.query_timeout_duration(),
            retries: config.retries,
            backoff: config.retry_backoff_duration(),
        }
    }

    pub fn with_custom(mut self, custom: Vec<CustomQuery>) -> Self {
        self.custom = custom;
        self
    }

    pub fn with_retry_policy(mut self, timeout: Duration, retries: u32, backoff: Duration) -> Self {
        self.timeout = timeout;
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Collect one snapshot stamped with `now`.
    pub async fn collect(&self, now: u64) -> MetricsResult<MetricsSnapshot> {
        let (cpu, memory, pending, nodes) = tokio::join!(
            self.query_with_retry("cpu", &self.queries.cpu),
            self.query_with_retry("memory", &self.queries.memory),
            self.query_with_retry("pending", &self.queries.pending),
            self.query_with_retry("ready_nodes", &self.queries.ready_nodes),
        );

        let cpu = percentage("cpu", required("cpu", cpu?)?)?;
        let memory = percentage("memory", required("memory", memory?)?)?;
        // Nothing unschedulable evaluates to an empty vector.
        let pending = count("pending", pending?.unwrap_or(0.0))?;
        let nodes = count("ready_nodes", required("ready_nodes", nodes?)?)?;

        let mut snapshot = MetricsSnapshot::new(now, cpu, memory, pending, nodes);

        for custom in &self.custom {
            match self.query_with_retry(&custom.name, &custom.expr).await {
                Ok(Some(value)) => {
                    snapshot.custom.insert(custom.name.clone(), value);
                }
                Ok(None) => debug!(signal = %custom.name, "custom signal returned no data"),
                Err(e) => warn!(signal = %custom.name, error = %e, "dropping custom signal"),
            }
        }

        debug!(
            cpu = snapshot.cpu_percent,
            memory = snapshot.memory_percent,
            pending = snapshot.pending_work_items,
            nodes = snapshot.node_count,
            custom = snapshot.custom.len(),
            "metrics collected"
        );

        Ok(snapshot)
    }

    /// One query under the timeout, retried with a fixed backoff.
    ///
    /// Malformed answers are not retried. When every attempt fails the
    /// error is reported as `Unavailable`.
    async fn query_with_retry(&self, name: &str, expr: &str) -> MetricsResult<Option<f64>> {
        let mut last: Option<MetricsError> = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff).await;
            }

            match tokio::time::timeout(self.timeout, self.source.query(expr)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.kind == MetricsErrorKind::Malformed => {
                    return Err(MetricsError::new(e.kind, name, e.message));
                }
                Ok(Err(e)) => {
                    debug!(signal = %name, attempt, error = %e, "metrics query failed");
                    last = Some(e);
                }
                Err(_) => {
                    debug!(signal = %name, attempt, "metrics query timed out");
                    last = Some(MetricsError::new(
                        MetricsErrorKind::Timeout,
                        name,
                        format!("no answer within {:?}", self.timeout),
                    ));
                }
            }
        }

        let message = last
            .map(|e| format!("{} attempts failed, last: {}", self.retries + 1, e.message))
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(MetricsError::unavailable(name, message))
    }
}

fn required(name: &str, value: Option<f64>) -> MetricsResult<f64> {
    value.ok_or_else(|| MetricsError::malformed(name, "query returned no samples"))
}

fn percentage(name: &str, value: f64) -> MetricsResult<f64> {
    if !(0.0..=100.5).contains(&value) {
        return Err(MetricsError::malformed(name, format!("{value} is not a percentage")));
    }
    Ok(value.min(100.0))
}

fn count(name: &str, value: f64) -> MetricsResult<u32> {
    if value < 0.0 || value > u32::MAX as f64 {
        return Err(MetricsError::malformed(name, format!("{value} is not a count")));
    }
    Ok(value.round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;

    fn healthy_source() -> Arc<StaticSource> {
        let source = Arc::new(StaticSource::new());
        source.set(CPU_QUERY, 55.0);
        source.set(MEMORY_QUERY, 40.0);
        source.set(PENDING_QUERY, 3.0);
        source.set(READY_NODES_QUERY, 4.0);
        source
    }

    #[tokio::test(start_paused = true)]
    async fn collects_core_signals() {
        let source = healthy_source();
        let collector = MetricsCollector::new(source.clone());

        let snapshot = collector.collect(1_000).await.unwrap();
        assert_eq!(snapshot.timestamp, 1_000);
        assert_eq!(snapshot.cpu_percent, 55.0);
        assert_eq!(snapshot.memory_percent, 40.0);
        assert_eq!(snapshot.pending_work_items, 3);
        assert_eq!(snapshot.node_count, 4);
        assert!(snapshot.custom.is_empty());
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pending_counts_as_zero() {
        let source = Arc::new(StaticSource::new());
        source.set(CPU_QUERY, 10.0);
        source.set(MEMORY_QUERY, 10.0);
        source.set(READY_NODES_QUERY, 2.0);

        let snapshot = MetricsCollector::new(source).collect(5).await.unwrap();
        assert_eq!(snapshot.pending_work_items, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let source = healthy_source();
        source.fail_next(CPU_QUERY, 2);

        let snapshot = MetricsCollector::new(source.clone()).collect(1).await.unwrap();
        assert_eq!(snapshot.cpu_percent, 55.0);
        // Two extra attempts for cpu.
        assert_eq!(source.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_unavailable() {
        let source = healthy_source();
        source.fail_next(MEMORY_QUERY, 3);

        let err = MetricsCollector::new(source).collect(1).await.unwrap_err();
        assert_eq!(err.kind, MetricsErrorKind::Unavailable);
        assert_eq!(err.query, "memory");
        assert!(err.message.contains("3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_source_is_unavailable() {
        let source = healthy_source();
        source.set_offline(true);
        let err = MetricsCollector::new(source).collect(1).await.unwrap_err();
        assert_eq!(err.kind, MetricsErrorKind::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_cpu_is_malformed() {
        let source = healthy_source();
        source.set(CPU_QUERY, 340.0);
        let err = MetricsCollector::new(source).collect(1).await.unwrap_err();
        assert_eq!(err.kind, MetricsErrorKind::Malformed);
        assert_eq!(err.query, "cpu");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_custom_signal_is_dropped() {
        let source = healthy_source();
        source.set("queue_depth_expr", 1200.0);
        source.fail_next("latency_expr", 10);

        let collector = MetricsCollector::new(source).with_custom(vec![
            CustomQuery {
                name: "queue_depth".into(),
                expr: "queue_depth_expr".into(),
            },
            CustomQuery {
                name: "latency_p95_ms".into(),
                expr: "latency_expr".into(),
            },
        ]);

        let snapshot = collector.collect(1).await.unwrap();
        assert_eq!(snapshot.custom.get("queue_depth"), Some(&1200.0));
        assert!(!snapshot.custom.contains_key("latency_p95_ms"));
    }

    #[test]
    fn overrides_replace_named_queries() {
        let mut overrides = BTreeMap::new();
        overrides.insert("cpu".to_string(), "custom_cpu".to_string());
        overrides.insert("bogus".to_string(), "x".to_string());

        let set = QuerySet::with_overrides(&overrides);
        assert_eq!(set.cpu, "custom_cpu");
        assert_eq!(set.memory, MEMORY_QUERY);
    }

    #[test]
    fn from_config_carries_retry_policy() {
        let mut config = MetricsConfig::default();
        config.retries = 4;
        config.query_timeout = "3s".into();
        config.custom.push(nodefleet_core::config::CustomMetricConfig {
            name: "queue_depth".into(),
            query: "q".into(),
            limit: 1000.0,
        });

        let collector = MetricsCollector::from_config(Arc::new(StaticSource::new()), &config);
        assert_eq!(collector.retries, 4);
        assert_eq!(collector.timeout, Duration::from_secs(3));
        assert_eq!(collector.custom.len(), 1);
    }
}
