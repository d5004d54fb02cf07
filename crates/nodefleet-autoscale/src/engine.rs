//! Decision engine — reactive, custom-signal and predictive layers plus
//! the minimum/maximum clamps and per-direction cooldowns.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use nodefleet_core::{FleetConfig, ThresholdSchedule, ThresholdSet, hour_of_day, minute_of_hour};
use nodefleet_state::{MetricsHistory, MetricsSnapshot, ScaleAction};

use crate::forecast::HourlyForecast;

/// Forecasts resting on fewer readings than this never trigger a scale-up.
pub const MIN_FORECAST_CONFIDENCE: f64 = 0.3;

/// What the engine wants done this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecisionAction::ScaleUp => "scale_up",
            DecisionAction::ScaleDown => "scale_down",
            DecisionAction::NoAction => "no_action",
        })
    }
}

/// Result of one evaluation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: DecisionAction,
    /// Nodes to add or remove; 0 for `NoAction`.
    pub node_delta: u32,
    pub reason: String,
    /// Set when a bound was enforced regardless of cooldown.
    pub bypass_cooldown: bool,
    /// Set when an action was warranted but its cooldown is still running.
    #[serde(default)]
    pub cooldown_blocked: bool,
}

impl ScalingDecision {
    pub fn scale_up(delta: u32, reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::ScaleUp,
            node_delta: delta,
            reason: reason.into(),
            bypass_cooldown: false,
            cooldown_blocked: false,
        }
    }

    pub fn scale_down(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::ScaleDown,
            node_delta: 1,
            reason: reason.into(),
            bypass_cooldown: false,
            cooldown_blocked: false,
        }
    }

    pub fn no_action(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::NoAction,
            node_delta: 0,
            reason: reason.into(),
            bypass_cooldown: false,
            cooldown_blocked: false,
        }
    }

    fn bypassing_cooldown(mut self) -> Self {
        self.bypass_cooldown = true;
        self
    }

    fn in_cooldown(reason: String) -> Self {
        let mut decision = Self::no_action(reason);
        decision.cooldown_blocked = true;
        decision
    }

    pub fn is_action(&self) -> bool {
        self.action != DecisionAction::NoAction
    }
}

/// Static engine settings derived from the fleet configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub schedule: ThresholdSchedule,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    /// Consecutive readings (current included) required to scale up.
    pub scale_up_readings: usize,
    /// Consecutive readings (current included) required to scale down.
    pub scale_down_readings: usize,
    /// Custom signal name → limit. Exceeding any limit triggers a scale-up.
    pub custom_limits: BTreeMap<String, f64>,
    /// Length of the late-hour predictive window; `None` disables it.
    pub predictive_window_minutes: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_nodes: 2,
            max_nodes: 10,
            schedule: ThresholdSchedule::default(),
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
            scale_up_readings: 2,
            scale_down_readings: 5,
            custom_limits: BTreeMap::new(),
            predictive_window_minutes: Some(10),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            min_nodes: config.cluster.min_nodes,
            max_nodes: config.cluster.max_nodes,
            schedule: config.threshold_schedule(),
            scale_up_cooldown: config.cooldown.scale_up_duration(),
            scale_down_cooldown: config.cooldown.scale_down_duration(),
            scale_up_readings: config.sustained.scale_up_readings,
            scale_down_readings: config.sustained.scale_down_readings,
            custom_limits: config.metrics.custom_limits(),
            predictive_window_minutes: config
                .predictive
                .enabled
                .then(|| config.predictive.window_minutes()),
        }
    }

    /// Whether `now` falls in the late-hour predictive window.
    pub fn in_predictive_window(&self, now: u64) -> bool {
        match self.predictive_window_minutes {
            Some(window) if window > 0 => minute_of_hour(now) >= 60u32.saturating_sub(window),
            _ => false,
        }
    }
}

/// Everything one evaluation looks at.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    /// The reading for this cycle.
    pub snapshot: &'a MetricsSnapshot,
    /// Earlier readings, not including `snapshot`.
    pub history: &'a MetricsHistory,
    pub node_count: u32,
    pub last_scale_time: Option<u64>,
    pub last_scale_action: ScaleAction,
    pub now: u64,
    /// Expected load for the upcoming hour, when one could be computed.
    pub forecast: Option<&'a HourlyForecast>,
}

/// Pure scaling policy. Holds configuration only.
#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    config: EngineConfig,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate one cycle.
    pub fn decide(&self, input: &DecisionInput<'_>) -> ScalingDecision {
        let cfg = &self.config;
        let thresholds = cfg.schedule.for_hour(hour_of_day(input.now));
        let nodes = input.node_count;

        if nodes < cfg.min_nodes {
            let delta = cfg.min_nodes - nodes;
            return ScalingDecision::scale_up(
                delta,
                format!("{nodes} nodes is below the minimum of {}", cfg.min_nodes),
            )
            .bypassing_cooldown();
        }

        if nodes > cfg.max_nodes {
            return ScalingDecision::scale_down(format!(
                "{nodes} nodes is above the maximum of {}",
                cfg.max_nodes
            ))
            .bypassing_cooldown();
        }

        if let Some((delta, reason)) = self.scale_up_trigger(input, &thresholds) {
            if nodes >= cfg.max_nodes {
                return ScalingDecision::no_action(format!(
                    "at capacity ({} nodes): {reason}",
                    cfg.max_nodes
                ));
            }
            if let Some(remaining) =
                cooldown_remaining(input, ScaleAction::ScaleUp, cfg.scale_up_cooldown)
            {
                return ScalingDecision::in_cooldown(format!(
                    "scale-up cooldown, {remaining}s remaining: {reason}"
                ));
            }

            let headroom = cfg.max_nodes - nodes;
            if delta > headroom {
                return ScalingDecision::scale_up(
                    headroom,
                    format!("{reason} (capped at {} nodes)", cfg.max_nodes),
                );
            }
            return ScalingDecision::scale_up(delta, reason);
        }

        if self.scale_down_sustained(input, &thresholds) {
            if nodes <= cfg.min_nodes {
                return ScalingDecision::no_action(format!(
                    "low utilization but already at minimum of {} nodes",
                    cfg.min_nodes
                ));
            }
            if let Some(remaining) =
                cooldown_remaining(input, ScaleAction::ScaleDown, cfg.scale_down_cooldown)
            {
                return ScalingDecision::in_cooldown(format!(
                    "scale-down cooldown, {remaining}s remaining"
                ));
            }
            return ScalingDecision::scale_down(format!(
                "CPU < {}% and memory < {}% with no pending work for {} readings",
                thresholds.cpu_down, thresholds.memory_down, cfg.scale_down_readings
            ));
        }

        ScalingDecision::no_action("within thresholds")
    }

    /// First-match of the OR-combined scale-up triggers with its size.
    fn scale_up_trigger(
        &self,
        input: &DecisionInput<'_>,
        t: &ThresholdSet,
    ) -> Option<(u32, String)> {
        let cfg = &self.config;
        let snap = input.snapshot;
        let mut reasons = Vec::new();

        if sustained(input, cfg.scale_up_readings, |s| s.cpu_percent >= t.cpu_up) {
            reasons.push(format!(
                "CPU {:.1}% >= {}% for {} readings",
                snap.cpu_percent, t.cpu_up, cfg.scale_up_readings
            ));
        }
        if snap.pending_work_items > 0 {
            reasons.push(format!("{} unschedulable work items", snap.pending_work_items));
        }
        if sustained(input, cfg.scale_up_readings, |s| s.memory_percent >= t.memory_up) {
            reasons.push(format!(
                "memory {:.1}% >= {}% for {} readings",
                snap.memory_percent, t.memory_up, cfg.scale_up_readings
            ));
        }
        for (name, limit) in &cfg.custom_limits {
            if let Some(value) = snap.custom.get(name).filter(|v| *v > limit) {
                reasons.push(format!("{name} {value:.1} > {limit}"));
            }
        }

        if !reasons.is_empty() {
            let extreme = snap.cpu_percent > t.extreme_cpu || snap.pending_work_items > t.pending_urgent;
            let delta = if extreme { 2 } else { 1 };
            return Some((delta, reasons.join("; ")));
        }

        self.predictive_trigger(input, t).map(|reason| (1, reason))
    }

    fn predictive_trigger(&self, input: &DecisionInput<'_>, t: &ThresholdSet) -> Option<String> {
        let forecast = input.forecast?;
        if !self.config.in_predictive_window(input.now) {
            return None;
        }
        if forecast.confidence() < MIN_FORECAST_CONFIDENCE {
            debug!(samples = forecast.samples, confidence = forecast.confidence(), "forecast too thin to act on");
            return None;
        }
        let snap = input.snapshot;

        let reason = if forecast.cpu_percent > t.cpu_up && snap.cpu_percent < t.cpu_up {
            format!(
                "predicted CPU {:.1}% for hour {} ({} samples)",
                forecast.cpu_percent, forecast.hour, forecast.samples
            )
        } else if forecast.memory_percent > t.memory_up && snap.memory_percent < t.memory_up {
            format!(
                "predicted memory {:.1}% for hour {} ({} samples)",
                forecast.memory_percent, forecast.hour, forecast.samples
            )
        } else {
            return None;
        };

        debug!(
            hour = forecast.hour,
            samples = forecast.samples,
            confidence = forecast.confidence(),
            "predictive scale-up"
        );
        Some(reason)
    }

    fn scale_down_sustained(&self, input: &DecisionInput<'_>, t: &ThresholdSet) -> bool {
        sustained(input, self.config.scale_down_readings, |s| {
            s.cpu_percent < t.cpu_down && s.memory_percent < t.memory_down && s.pending_work_items == 0
        })
    }
}

/// Whether `pred` holds for the current reading and the `readings - 1`
/// readings before it. Too short a history never satisfies the window.
fn sustained(input: &DecisionInput<'_>, readings: usize, pred: impl Fn(&MetricsSnapshot) -> bool) -> bool {
    let earlier = readings.saturating_sub(1);
    pred(input.snapshot)
        && input.history.len() >= earlier
        && input.history.recent(earlier).all(&pred)
}

/// Seconds of cooldown left for `direction`, if it is still active.
fn cooldown_remaining(input: &DecisionInput<'_>, direction: ScaleAction, cooldown: Duration) -> Option<u64> {
    if input.last_scale_action != direction {
        return None;
    }
    let last = input.last_scale_time?;
    let elapsed = input.now.saturating_sub(last);
    let cooldown = cooldown.as_secs();
    (elapsed < cooldown).then(|| cooldown - elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1970-01-05 10:05 UTC, outside the predictive window.
    const NOW: u64 = 4 * 86_400 + 10 * 3_600 + 5 * 60;

    fn snap(ts: u64, cpu: f64, memory: f64, pending: u32) -> MetricsSnapshot {
        MetricsSnapshot::new(ts, cpu, memory, pending, 3)
    }

    fn history(readings: &[(f64, f64, u32)]) -> MetricsHistory {
        let mut h = MetricsHistory::with_capacity(6);
        let start = NOW - 120 * readings.len() as u64;
        for (i, (cpu, mem, pending)) in readings.iter().enumerate() {
            h.push(snap(start + 120 * i as u64, *cpu, *mem, *pending));
        }
        h
    }

    fn input<'a>(snapshot: &'a MetricsSnapshot, history: &'a MetricsHistory, nodes: u32) -> DecisionInput<'a> {
        DecisionInput {
            snapshot,
            history,
            node_count: nodes,
            last_scale_time: None,
            last_scale_action: ScaleAction::None,
            now: snapshot.timestamp,
            forecast: None,
        }
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(EngineConfig::default())
    }

    #[test]
    fn single_cpu_spike_is_ignored() {
        let engine = engine();
        let first = snap(NOW, 76.0, 40.0, 0);
        let empty = MetricsHistory::default();
        assert_eq!(engine.decide(&input(&first, &empty, 3)).action, DecisionAction::NoAction);

        // The spike is stored and the next reading falls back.
        let h = history(&[(76.0, 40.0, 0)]);
        let second = snap(NOW, 50.0, 40.0, 0);
        assert_eq!(engine.decide(&input(&second, &h, 3)).action, DecisionAction::NoAction);
    }

    #[test]
    fn two_consecutive_high_cpu_readings_scale_up() {
        let h = history(&[(72.0, 40.0, 0)]);
        let current = snap(NOW, 70.0, 40.0, 0);
        let decision = engine().decide(&input(&current, &h, 3));
        assert_eq!(decision.action, DecisionAction::ScaleUp);
        assert_eq!(decision.node_delta, 1);
    }

    #[test]
    fn scenario_a_pending_work_scales_immediately() {
        let empty = MetricsHistory::default();
        let current = snap(NOW, 82.0, 40.0, 3);
        let decision = engine().decide(&input(&current, &empty, 2));
        assert_eq!(decision.action, DecisionAction::ScaleUp);
        assert_eq!(decision.node_delta, 1);
        assert!(decision.reason.contains("unschedulable"));
    }

    #[test]
    fn scenario_a_without_pending_waits() {
        let empty = MetricsHistory::default();
        let current = snap(NOW, 82.0, 40.0, 0);
        let decision = engine().decide(&input(&current, &empty, 2));
        assert_eq!(decision.action, DecisionAction::NoAction);
    }

    #[test]
    fn scenario_b_sustained_cpu_cites_cpu() {
        let h = history(&[(71.0, 40.0, 0), (74.0, 40.0, 0)]);
        let current = snap(NOW, 78.0, 40.0, 0);
        let decision = engine().decide(&input(&current, &h, 3));
        assert_eq!(decision.action, DecisionAction::ScaleUp);
        assert_eq!(decision.node_delta, 1);
        assert!(decision.reason.contains("CPU"));
    }

    #[test]
    fn scenario_c_scale_down_blocked_at_minimum() {
        let h = history(&[(10.0, 20.0, 0); 4]);
        let current = snap(NOW, 12.0, 25.0, 0);
        let decision = engine().decide(&input(&current, &h, 2));
        assert_eq!(decision.action, DecisionAction::NoAction);
        assert!(decision.reason.contains("minimum"));
    }

    #[test]
    fn sustained_low_utilization_scales_down_by_one() {
        let h = history(&[(10.0, 20.0, 0); 4]);
        let current = snap(NOW, 12.0, 25.0, 0);
        let decision = engine().decide(&input(&current, &h, 5));
        assert_eq!(decision.action, DecisionAction::ScaleDown);
        assert_eq!(decision.node_delta, 1);
    }

    #[test]
    fn short_low_window_does_not_scale_down() {
        let h = history(&[(10.0, 20.0, 0), (50.0, 20.0, 0), (10.0, 20.0, 0), (10.0, 20.0, 0)]);
        let current = snap(NOW, 12.0, 25.0, 0);
        let decision = engine().decide(&input(&current, &h, 5));
        assert_eq!(decision.action, DecisionAction::NoAction);
    }

    #[test]
    fn cooldown_blocks_then_expires() {
        let engine = engine();
        let t0 = NOW;
        let h = history(&[(80.0, 40.0, 0)]);

        let at_2min = snap(t0 + 120, 80.0, 40.0, 0);
        let mut i = input(&at_2min, &h, 4);
        i.last_scale_time = Some(t0);
        i.last_scale_action = ScaleAction::ScaleUp;
        let decision = engine.decide(&i);
        assert_eq!(decision.action, DecisionAction::NoAction);
        assert!(decision.reason.contains("cooldown"));
        assert!(decision.cooldown_blocked);

        let at_6min = snap(t0 + 360, 80.0, 40.0, 0);
        let mut i = input(&at_6min, &h, 4);
        i.last_scale_time = Some(t0);
        i.last_scale_action = ScaleAction::ScaleUp;
        assert_eq!(engine.decide(&i).action, DecisionAction::ScaleUp);
    }

    #[test]
    fn cooldown_is_per_direction() {
        let h = history(&[(80.0, 40.0, 0)]);
        let current = snap(NOW + 60, 80.0, 40.0, 0);
        let mut i = input(&current, &h, 4);
        i.last_scale_time = Some(NOW);
        i.last_scale_action = ScaleAction::ScaleDown;
        assert_eq!(engine().decide(&i).action, DecisionAction::ScaleUp);
    }

    #[test]
    fn minimum_enforcement_bypasses_cooldown() {
        let empty = MetricsHistory::default();
        let current = snap(NOW + 30, 20.0, 20.0, 0);
        let mut i = input(&current, &empty, 0);
        i.last_scale_time = Some(NOW);
        i.last_scale_action = ScaleAction::ScaleUp;

        let decision = engine().decide(&i);
        assert_eq!(decision.action, DecisionAction::ScaleUp);
        assert_eq!(decision.node_delta, 2);
        assert!(decision.bypass_cooldown);
    }

    #[test]
    fn at_capacity_reports_no_action() {
        let h = history(&[(90.0, 40.0, 0)]);
        let current = snap(NOW, 92.0, 40.0, 0);
        let decision = engine().decide(&input(&current, &h, 10));
        assert_eq!(decision.action, DecisionAction::NoAction);
        assert!(decision.reason.contains("at capacity"));
    }

    #[test]
    fn extreme_load_adds_two_capped_at_max() {
        let h = history(&[(90.0, 40.0, 0)]);
        let current = snap(NOW, 92.0, 40.0, 0);

        let decision = engine().decide(&input(&current, &h, 5));
        assert_eq!(decision.node_delta, 2);

        let decision = engine().decide(&input(&current, &h, 9));
        assert_eq!(decision.action, DecisionAction::ScaleUp);
        assert_eq!(decision.node_delta, 1);
        assert!(decision.reason.contains("capped"));
    }

    #[test]
    fn urgent_backlog_adds_two() {
        let empty = MetricsHistory::default();
        let current = snap(NOW, 40.0, 40.0, 8);
        assert_eq!(engine().decide(&input(&current, &empty, 3)).node_delta, 2);
    }

    #[test]
    fn custom_signal_over_limit_scales_up() {
        let mut config = EngineConfig::default();
        config.custom_limits.insert("queue_depth".into(), 1000.0);
        let engine = DecisionEngine::new(config);

        let empty = MetricsHistory::default();
        let mut current = snap(NOW, 40.0, 40.0, 0);
        current.custom.insert("queue_depth".into(), 1500.0);

        let decision = engine.decide(&input(&current, &empty, 3));
        assert_eq!(decision.action, DecisionAction::ScaleUp);
        assert!(decision.reason.contains("queue_depth"));
    }

    #[test]
    fn above_maximum_scales_down() {
        let empty = MetricsHistory::default();
        let current = snap(NOW, 50.0, 50.0, 0);
        let decision = engine().decide(&input(&current, &empty, 11));
        assert_eq!(decision.action, DecisionAction::ScaleDown);
        assert!(decision.bypass_cooldown);
    }

    #[test]
    fn forecast_triggers_only_in_late_window() {
        let forecast = HourlyForecast {
            hour: 11,
            cpu_percent: 82.0,
            memory_percent: 40.0,
            samples: 5,
        };
        let empty = MetricsHistory::default();

        // 10:05 is outside the last ten minutes of the hour.
        let early = snap(NOW, 50.0, 40.0, 0);
        let mut i = input(&early, &empty, 3);
        i.forecast = Some(&forecast);
        assert_eq!(engine().decide(&i).action, DecisionAction::NoAction);

        // 10:52 is inside.
        let late = snap(NOW + 47 * 60, 50.0, 40.0, 0);
        let mut i = input(&late, &empty, 3);
        i.forecast = Some(&forecast);
        let decision = engine().decide(&i);
        assert_eq!(decision.action, DecisionAction::ScaleUp);
        assert_eq!(decision.node_delta, 1);
        assert!(decision.reason.contains("predicted CPU"));
    }

    #[test]
    fn thin_forecast_is_ignored() {
        let forecast = HourlyForecast {
            hour: 11,
            cpu_percent: 95.0,
            memory_percent: 40.0,
            samples: 2,
        };
        let empty = MetricsHistory::default();
        let late = snap(NOW + 47 * 60, 50.0, 40.0, 0);
        let mut i = input(&late, &empty, 3);
        i.forecast = Some(&forecast);
        assert_eq!(engine().decide(&i).action, DecisionAction::NoAction);
    }

    #[test]
    fn time_of_day_schedule_changes_thresholds() {
        use nodefleet_core::ThresholdWindow;

        let mut config = EngineConfig::default();
        config.schedule = ThresholdSchedule::new(
            ThresholdSet::default(),
            vec![ThresholdWindow {
                start_hour: 9,
                end_hour: 18,
                cpu_up: Some(60.0),
                ..Default::default()
            }],
        );
        let engine = DecisionEngine::new(config);

        let h = history(&[(65.0, 40.0, 0)]);
        let current = snap(NOW, 66.0, 40.0, 0);
        assert_eq!(engine.decide(&input(&current, &h, 3)).action, DecisionAction::ScaleUp);
    }

    #[test]
    fn from_config_disables_prediction() {
        let mut fleet = FleetConfig::default();
        fleet.predictive.enabled = false;
        let config = EngineConfig::from_config(&fleet);
        assert_eq!(config.predictive_window_minutes, None);
        assert!(!config.in_predictive_window(NOW + 55 * 60));
    }
}
