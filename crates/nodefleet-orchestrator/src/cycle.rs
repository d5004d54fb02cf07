//! One scaling cycle under the cluster lock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use nodefleet_autoscale::{DecisionAction, DecisionEngine, DecisionInput, EngineConfig, HourlyForecast, ScalingDecision};
use nodefleet_core::{FleetConfig, hour_of_day};
use nodefleet_lifecycle::{BlockReason, DeprovisionOutcome, InterruptionReport, NodeLifecycleManager, ProvisionReport};
use nodefleet_metrics::MetricsCollector;
use nodefleet_state::{
    ClusterState, EventKind, MetricsSnapshot, ScaleAction, ScalingEvent, StateResult, StateStore, StateUpdate,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::lock::LockGuard;
use crate::notify::NotificationSink;

const DAY_SECS: u64 = 86_400;
const STORE_ATTEMPTS: u32 = 3;
const STORE_BACKOFF: Duration = Duration::from_millis(500);

static CYCLE_SEQ: AtomicU64 = AtomicU64::new(0);

/// States of the per-invocation state machine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Start,
    AcquireLock,
    CollectMetrics,
    LoadState,
    CheckCooldown,
    Decide,
    Execute,
    UpdateState,
    ReleaseLock,
    Notify,
    End,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another invocation holds a live lock.
    LockHeld,
    /// No metrics and no fresh cached reading.
    MetricsUnavailable { consecutive_failures: u32 },
    /// An action was warranted but its cooldown is running.
    CooldownBlocked { reason: String },
    NoAction { reason: String },
    ScaledUp { requested: u32, ready: u32, join_failed: u32 },
    ScaledDown { instance_id: String },
    /// Reclaimed spot nodes were drained and replaced; no decision was made.
    InterruptionHandled { interrupted: u32, replaced: u32 },
    SafetyBlocked { reason: String, node: Option<String> },
    Failed { error: String },
}

/// Terminal report of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleResult {
    pub cluster_id: String,
    pub started_at: u64,
    /// Last phase reached.
    pub phase: CyclePhase,
    pub outcome: CycleOutcome,
    pub decision: Option<ScalingDecision>,
    /// Recorded node count after the cycle.
    pub node_count: u32,
    /// The decision ran on a cached reading.
    pub used_cached_metrics: bool,
    /// Event emitted to the journal and sinks, if any.
    pub event: Option<ScalingEvent>,
}

impl CycleResult {
    fn new(cluster_id: &str, started_at: u64) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            started_at,
            phase: CyclePhase::Start,
            outcome: CycleOutcome::LockHeld,
            decision: None,
            node_count: 0,
            used_cached_metrics: false,
            event: None,
        }
    }

    fn event(&mut self, kind: EventKind, delta: u32, reason: impl Into<String>) {
        self.event = Some(ScalingEvent::new(kind, &self.cluster_id, delta, reason, self.started_at));
    }
}

/// Per-cluster orchestration settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub cluster_id: String,
    pub lock_ttl: Duration,
    /// Work under the lock is abandoned after this long.
    pub cycle_deadline: Duration,
    pub history_capacity: usize,
    /// Failed collections in a row before the cycle gives up and reports.
    pub max_consecutive_failures: u32,
    /// Oldest cached reading that may stand in for a failed collection.
    pub staleness: Duration,
    pub predictive_enabled: bool,
    pub lookback_days: u32,
    pub min_samples: usize,
    pub archive_retention: Duration,
    pub handle_interruptions: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            cluster_id: "node-fleet-cluster".to_string(),
            lock_ttl: Duration::from_secs(600),
            cycle_deadline: Duration::from_secs(540),
            history_capacity: 6,
            max_consecutive_failures: 3,
            staleness: Duration::from_secs(600),
            predictive_enabled: true,
            lookback_days: 7,
            min_samples: 3,
            archive_retention: Duration::from_secs(30 * DAY_SECS),
            handle_interruptions: true,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            cluster_id: config.cluster.id.clone(),
            lock_ttl: config.lock.ttl_duration(),
            cycle_deadline: config.lock.cycle_deadline(),
            history_capacity: config.sustained.history_capacity,
            max_consecutive_failures: config.metrics.max_consecutive_failures,
            staleness: config.metrics.staleness_duration(),
            predictive_enabled: config.predictive.enabled,
            lookback_days: config.predictive.lookback_days,
            min_samples: config.predictive.min_samples,
            archive_retention: config.predictive.archive_retention_duration(),
            handle_interruptions: config.lifecycle.handle_spot_interruptions,
        }
    }
}

/// The reading a decision is made on.
struct Observation {
    snapshot: MetricsSnapshot,
    cached: bool,
}

/// Wires collector, engine, lifecycle manager, state store and sinks
/// into the scaling cycle.
pub struct Orchestrator {
    store: StateStore,
    collector: MetricsCollector,
    engine: DecisionEngine,
    lifecycle: NodeLifecycleManager,
    sinks: Vec<Arc<dyn NotificationSink>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        collector: MetricsCollector,
        engine: DecisionEngine,
        lifecycle: NodeLifecycleManager,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            collector,
            engine,
            lifecycle,
            sinks: Vec::new(),
            settings,
        }
    }

    /// Assemble an orchestrator from a validated configuration.
    pub fn from_config(
        config: &FleetConfig,
        store: StateStore,
        collector: MetricsCollector,
        lifecycle: NodeLifecycleManager,
    ) -> Self {
        Self::new(
            store,
            collector,
            DecisionEngine::new(EngineConfig::from_config(config)),
            lifecycle,
            OrchestratorSettings::from_config(config),
        )
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run one cycle at `now`.
    ///
    /// Never returns an error: failures are reported as
    /// [`CycleOutcome::Failed`] with a `cycle_failed` event.
    pub async fn run_cycle(&self, now: u64) -> CycleResult {
        let cluster_id = self.settings.cluster_id.as_str();
        let mut result = CycleResult::new(cluster_id, now);
        let token = format!(
            "{}-{}-{}",
            std::process::id(),
            now,
            CYCLE_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        result.phase = CyclePhase::AcquireLock;
        let acquired = with_store_retry("acquire lock", || {
            LockGuard::acquire(&self.store, cluster_id, &token, self.settings.lock_ttl, now)
        })
        .await;
        let guard = match acquired {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(cluster = %cluster_id, "lock held elsewhere, skipping cycle");
                result.outcome = CycleOutcome::LockHeld;
                return result;
            }
            Err(e) => {
                error!(cluster = %cluster_id, error = %e, "state store unavailable");
                result.outcome = CycleOutcome::Failed { error: e.to_string() };
                result.event(EventKind::CycleFailed, 0, format!("lock acquisition failed: {e}"));
                self.notify(&result).await;
                return result;
            }
        };

        let deadline = self.settings.cycle_deadline;
        let cycle = tokio::time::timeout(deadline, self.locked_cycle(now, guard.token(), &mut result)).await;
        let failure = match cycle {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("exceeded the {}s cycle deadline", deadline.as_secs())),
        };
        if let Some(e) = failure {
            error!(cluster = %cluster_id, phase = %result.phase, error = %e, "cycle failed");
            result.outcome = CycleOutcome::Failed { error: e.clone() };
            result.event(EventKind::CycleFailed, 0, format!("failed during {}: {e}", result.phase));
        }

        if let Some(event) = &result.event {
            if let Err(e) = self.store.record_event(event) {
                warn!(cluster = %cluster_id, error = %e, "failed to journal event");
            }
        }

        result.phase = CyclePhase::ReleaseLock;
        match guard.release() {
            Ok(true) => {}
            Ok(false) => warn!(cluster = %cluster_id, %token, "lock was taken over before release"),
            Err(e) => error!(cluster = %cluster_id, error = %e, "failed to release lock"),
        }

        result.phase = CyclePhase::Notify;
        self.notify(&result).await;
        result.phase = CyclePhase::End;
        result
    }

    /// Everything between acquiring and releasing the lock. State writes
    /// only land while `token` still holds the lock.
    async fn locked_cycle(&self, now: u64, token: &str, result: &mut CycleResult) -> OrchestratorResult<()> {
        let cluster_id = self.settings.cluster_id.as_str();

        result.phase = CyclePhase::CollectMetrics;
        let collected = self.collector.collect(now).await;

        result.phase = CyclePhase::LoadState;
        let mut state = with_store_retry("read state", || self.store.read_state(cluster_id)).await?;
        state.metrics_history.resize(self.settings.history_capacity);
        result.node_count = state.node_count;

        let observation = match collected {
            Ok(snapshot) => {
                if let Err(e) = self.store.archive_snapshot(cluster_id, &snapshot) {
                    warn!(cluster = %cluster_id, error = %e, "failed to archive snapshot");
                }
                Observation {
                    snapshot,
                    cached: false,
                }
            }
            Err(e) => {
                let failures = state.consecutive_metric_failures + 1;
                match self.cached_observation(&mut state, failures, now) {
                    Some(observation) => {
                        warn!(cluster = %cluster_id, error = %e, failures, "metrics failed, using cached reading");
                        state.consecutive_metric_failures = failures;
                        observation
                    }
                    None => {
                        warn!(cluster = %cluster_id, error = %e, failures, "metrics unavailable, skipping cycle");
                        self.write_state(
                            token,
                            StateUpdate {
                                consecutive_metric_failures: Some(failures),
                                ..Default::default()
                            },
                        )
                        .await?;
                        if failures == self.settings.max_consecutive_failures {
                            result.event(
                                EventKind::MetricsUnavailable,
                                0,
                                format!("{failures} consecutive metrics failures: {e}"),
                            );
                        }
                        result.outcome = CycleOutcome::MetricsUnavailable {
                            consecutive_failures: failures,
                        };
                        return Ok(());
                    }
                }
            }
        };
        result.used_cached_metrics = observation.cached;

        if !state.initialized {
            info!(
                cluster = %cluster_id,
                observed = observation.snapshot.node_count,
                "first cycle, adopting observed node count"
            );
            state.node_count = observation.snapshot.node_count;
        }
        result.node_count = state.node_count;

        if self.settings.handle_interruptions {
            match self.lifecycle.handle_interruptions(now).await {
                Ok(report) if !report.is_empty() => {
                    result.phase = CyclePhase::Execute;
                    self.record_interruptions(&mut state, &report, result);
                    return self.persist(&state, observation, token, None, result).await;
                }
                Ok(_) => {}
                Err(e) => warn!(cluster = %cluster_id, error = %e, "failed to check spot interruption notices"),
            }
        }

        let forecast = self.forecast(now)?;
        let decision = self.engine.decide(&DecisionInput {
            snapshot: &observation.snapshot,
            history: &state.metrics_history,
            node_count: state.node_count,
            last_scale_time: state.last_scale_time,
            last_scale_action: state.last_scale_action,
            now,
            forecast: forecast.as_ref(),
        });
        result.decision = Some(decision.clone());

        if decision.cooldown_blocked {
            result.phase = CyclePhase::CheckCooldown;
            debug!(cluster = %cluster_id, reason = %decision.reason, "cooldown active");
            // Scaling record untouched; only the collection health counter moves.
            let failures = if observation.cached {
                state.consecutive_metric_failures
            } else {
                0
            };
            self.write_state(
                token,
                StateUpdate {
                    consecutive_metric_failures: Some(failures),
                    ..Default::default()
                },
            )
            .await?;
            result.outcome = CycleOutcome::CooldownBlocked {
                reason: decision.reason,
            };
            return Ok(());
        }

        result.phase = CyclePhase::Decide;
        info!(
            cluster = %cluster_id,
            action = %decision.action,
            delta = decision.node_delta,
            nodes = state.node_count,
            reason = %decision.reason,
            "scaling decision"
        );

        let bookkeeping = match decision.action {
            DecisionAction::NoAction => {
                result.outcome = CycleOutcome::NoAction {
                    reason: decision.reason.clone(),
                };
                None
            }
            DecisionAction::ScaleUp => {
                result.phase = CyclePhase::Execute;
                let report = self.lifecycle.provision(decision.node_delta).await?;
                self.record_scale_up(&mut state, &decision, &report, result)
            }
            DecisionAction::ScaleDown => {
                result.phase = CyclePhase::Execute;
                let outcome = self.lifecycle.deprovision().await?;
                self.record_scale_down(&mut state, &decision, outcome, result)
            }
        };

        self.persist(&state, observation, token, bookkeeping, result).await?;

        let retention_start = now.saturating_sub(self.settings.archive_retention.as_secs());
        match self.store.prune_archive(cluster_id, retention_start) {
            Ok(0) => {}
            Ok(pruned) => debug!(cluster = %cluster_id, pruned, "pruned metrics archive"),
            Err(e) => warn!(cluster = %cluster_id, error = %e, "failed to prune metrics archive"),
        }

        Ok(())
    }

    /// Stand in the latest history reading for a failed collection, when
    /// the failure budget allows and the reading is fresh enough.
    fn cached_observation(&self, state: &mut ClusterState, failures: u32, now: u64) -> Option<Observation> {
        if failures >= self.settings.max_consecutive_failures {
            return None;
        }
        let fresh = state
            .metrics_history
            .latest()
            .is_some_and(|s| s.age_secs(now) <= self.settings.staleness.as_secs());
        if !fresh {
            return None;
        }
        state.metrics_history.pop_latest().map(|snapshot| Observation {
            snapshot,
            cached: true,
        })
    }

    fn forecast(&self, now: u64) -> OrchestratorResult<Option<HourlyForecast>> {
        if !self.settings.predictive_enabled || !self.engine.config().in_predictive_window(now) {
            return Ok(None);
        }
        let since = now.saturating_sub(u64::from(self.settings.lookback_days) * DAY_SECS);
        let samples = self.store.list_archived(&self.settings.cluster_id, since)?;
        let target_hour = (hour_of_day(now) + 1) % 24;
        Ok(HourlyForecast::from_archive(&samples, target_hour, since, self.settings.min_samples))
    }

    fn record_scale_up(
        &self,
        state: &mut ClusterState,
        decision: &ScalingDecision,
        report: &ProvisionReport,
        result: &mut CycleResult,
    ) -> Option<ScaleAction> {
        let ready = report.ready_count();
        state.node_count += ready;

        result.outcome = CycleOutcome::ScaledUp {
            requested: report.requested,
            ready,
            join_failed: report.join_failed.len() as u32,
        };

        if report.is_partial() {
            let failed: Vec<&str> = report.join_failed.iter().map(|n| n.instance_id.as_str()).collect();
            let mut reason = format!(
                "{}; {ready}/{} nodes ready",
                decision.reason, report.requested
            );
            if !failed.is_empty() {
                reason.push_str(&format!(", join failed: {}", failed.join(", ")));
            }
            if !report.launch_failures.is_empty() {
                reason.push_str(&format!(", launch failures: {}", report.launch_failures.len()));
            }
            result.event(EventKind::PartialScaleUp, ready, reason);
        } else {
            result.event(EventKind::ScaleUp, ready, decision.reason.clone());
        }

        report.launched_any().then_some(ScaleAction::ScaleUp)
    }

    fn record_scale_down(
        &self,
        state: &mut ClusterState,
        decision: &ScalingDecision,
        outcome: DeprovisionOutcome,
        result: &mut CycleResult,
    ) -> Option<ScaleAction> {
        match outcome {
            DeprovisionOutcome::Removed(record) => {
                state.node_count = state.node_count.saturating_sub(1);
                result.event(
                    EventKind::ScaleDown,
                    1,
                    format!("{}; removed {}", decision.reason, record.instance_id),
                );
                result.outcome = CycleOutcome::ScaledDown {
                    instance_id: record.instance_id,
                };
                Some(ScaleAction::ScaleDown)
            }
            DeprovisionOutcome::Blocked { reason, node } => {
                let text = match &node {
                    Some(n) => format!("scale-down of {n} abandoned: {}", reason.as_str()),
                    None => format!("scale-down abandoned: {}", reason.as_str()),
                };
                result.event(EventKind::SafetyBlocked, 0, text);
                result.outcome = CycleOutcome::SafetyBlocked {
                    reason: block_reason_label(reason).to_string(),
                    node,
                };
                None
            }
        }
    }

    fn record_interruptions(&self, state: &mut ClusterState, report: &InterruptionReport, result: &mut CycleResult) {
        let lost = report.interrupted_count();
        let ready = report.replacements.ready_count();
        state.node_count = state.node_count.saturating_sub(lost) + ready;

        let ids: Vec<&str> = report.interrupted.iter().map(|n| n.instance_id.as_str()).collect();
        let mut reason = format!("spot interruption on {}; {ready}/{lost} replacements ready", ids.join(", "));
        if !report.undrained.is_empty() {
            reason.push_str(&format!(", not drained: {}", report.undrained.join(", ")));
        }
        result.event(EventKind::SpotInterruption, ready, reason);
        result.outcome = CycleOutcome::InterruptionHandled {
            interrupted: lost,
            replaced: ready,
        };
    }

    /// Merge `update` while `token` holds the lock, retrying store failures.
    async fn write_state(&self, token: &str, update: StateUpdate) -> OrchestratorResult<ClusterState> {
        let cluster_id = self.settings.cluster_id.as_str();
        with_store_retry("update state", || {
            self.store.update_state_as(cluster_id, token, update.clone())
        })
        .await?
        .ok_or(OrchestratorError::LockLost)
    }

    /// Write the cycle's state changes in one merge.
    async fn persist(
        &self,
        state: &ClusterState,
        observation: Observation,
        token: &str,
        action: Option<ScaleAction>,
        result: &mut CycleResult,
    ) -> OrchestratorResult<()> {
        result.phase = CyclePhase::UpdateState;
        let failures = if observation.cached {
            state.consecutive_metric_failures
        } else {
            0
        };

        let mut history = state.metrics_history.clone();
        history.push(observation.snapshot);

        let updated = self
            .write_state(
                token,
                StateUpdate {
                    node_count: Some(state.node_count),
                    initialized: Some(true),
                    last_scale_time: action.map(|_| result.started_at),
                    last_scale_action: action,
                    metrics_history: Some(history),
                    consecutive_metric_failures: Some(failures),
                },
            )
            .await?;
        result.node_count = updated.node_count;
        Ok(())
    }

    async fn notify(&self, result: &CycleResult) {
        let Some(event) = &result.event else {
            return;
        };
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event).await {
                warn!(cluster = %event.cluster_id, kind = event.kind.as_str(), error = %e, "notification failed");
            }
        }
    }
}

/// Run a state-store call, retrying failures with a short linear backoff
/// before the cycle gives up.
async fn with_store_retry<T>(what: &str, mut op: impl FnMut() -> StateResult<T>) -> StateResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if attempt < STORE_ATTEMPTS => {
                warn!(op = what, attempt, error = %e, "state store call failed, retrying");
                tokio::time::sleep(STORE_BACKOFF * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn block_reason_label(reason: BlockReason) -> &'static str {
    match reason {
        BlockReason::NoCandidate => "no_candidate",
        BlockReason::DisruptionBudget => "disruption_budget",
        BlockReason::DrainFailed => "drain_failed",
        BlockReason::DrainTimedOut => "drain_timed_out",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodefleet_state::StateError;

    #[test]
    fn outcome_serializes_with_tag() {
        let outcome = CycleOutcome::ScaledUp {
            requested: 2,
            ready: 1,
            join_failed: 1,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "scaled_up");
        assert_eq!(json["ready"], 1);

        let held = serde_json::to_value(&CycleOutcome::LockHeld).unwrap();
        assert_eq!(held["outcome"], "lock_held");
    }

    #[tokio::test(start_paused = true)]
    async fn store_failures_are_retried_then_surface() {
        let mut calls = 0;
        let value = with_store_retry("read state", || {
            calls += 1;
            if calls < STORE_ATTEMPTS {
                Err(StateError::Transaction("database busy".into()))
            } else {
                Ok(calls)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, STORE_ATTEMPTS);

        let mut calls = 0;
        let err = with_store_retry("update state", || -> StateResult<()> {
            calls += 1;
            Err(StateError::Write("disk full".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(calls, STORE_ATTEMPTS);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn settings_follow_config() {
        let mut config = FleetConfig::default();
        config.cluster.id = "prod".to_string();
        config.lock.ttl = "90s".to_string();
        config.metrics.max_consecutive_failures = 5;
        config.predictive.enabled = false;

        let settings = OrchestratorSettings::from_config(&config);
        assert_eq!(settings.cluster_id, "prod");
        assert_eq!(settings.lock_ttl, Duration::from_secs(90));
        assert_eq!(settings.cycle_deadline, Duration::from_secs(81));
        assert!(settings.handle_interruptions);
        assert_eq!(settings.max_consecutive_failures, 5);
        assert!(!settings.predictive_enabled);
    }

    #[test]
    fn block_labels_are_snake_case() {
        assert_eq!(block_reason_label(BlockReason::DisruptionBudget), "disruption_budget");
        assert_eq!(block_reason_label(BlockReason::DrainTimedOut), "drain_timed_out");
    }

    #[test]
    fn phases_display_by_name() {
        assert_eq!(CyclePhase::CheckCooldown.to_string(), "CheckCooldown");
    }
}
