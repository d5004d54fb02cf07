//! Time-of-day threshold schedules.
//!
//! Thresholds are never mutated at runtime. A `ThresholdSchedule` maps an
//! hour of day to the `ThresholdSet` in force, so business-hours or
//! overnight profiles are a pure lookup the decision engine performs each
//! cycle.

use serde::{Deserialize, Serialize};

/// Utilization thresholds (percentages) and urgency limits for one period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdSet {
    pub cpu_up: f64,
    pub cpu_down: f64,
    pub memory_up: f64,
    pub memory_down: f64,
    /// CPU above this sizes a scale-up at two nodes.
    pub extreme_cpu: f64,
    /// Unschedulable work items above this count as high urgency.
    pub pending_urgent: u32,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            cpu_up: 70.0,
            cpu_down: 30.0,
            memory_up: 75.0,
            memory_down: 50.0,
            extreme_cpu: 85.0,
            pending_urgent: 5,
        }
    }
}

/// An hour range whose overrides replace the base thresholds.
///
/// `start_hour..end_hour` is half-open; a window with `start_hour > end_hour`
/// wraps past midnight (e.g. 22..6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ThresholdWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub cpu_up: Option<f64>,
    pub cpu_down: Option<f64>,
    pub memory_up: Option<f64>,
    pub memory_down: Option<f64>,
}

impl ThresholdWindow {
    /// Whether `hour` falls inside this window.
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    fn apply(&self, base: &ThresholdSet) -> ThresholdSet {
        ThresholdSet {
            cpu_up: self.cpu_up.unwrap_or(base.cpu_up),
            cpu_down: self.cpu_down.unwrap_or(base.cpu_down),
            memory_up: self.memory_up.unwrap_or(base.memory_up),
            memory_down: self.memory_down.unwrap_or(base.memory_down),
            ..base.clone()
        }
    }
}

/// Base thresholds plus ordered hour windows. First matching window wins.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThresholdSchedule {
    base: ThresholdSet,
    windows: Vec<ThresholdWindow>,
}

impl ThresholdSchedule {
    pub fn new(base: ThresholdSet, windows: Vec<ThresholdWindow>) -> Self {
        Self { base, windows }
    }

    /// A schedule with no windows: the same thresholds all day.
    pub fn fixed(base: ThresholdSet) -> Self {
        Self::new(base, Vec::new())
    }

    /// Thresholds in force during `hour` (0-23).
    pub fn for_hour(&self, hour: u32) -> ThresholdSet {
        self.windows
            .iter()
            .find(|w| w.contains(hour))
            .map(|w| w.apply(&self.base))
            .unwrap_or_else(|| self.base.clone())
    }

    pub fn base(&self) -> &ThresholdSet {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn business_hours() -> ThresholdWindow {
        ThresholdWindow {
            start_hour: 9,
            end_hour: 18,
            cpu_up: Some(60.0),
            ..Default::default()
        }
    }

    #[test]
    fn fixed_schedule_returns_base() {
        let schedule = ThresholdSchedule::fixed(ThresholdSet::default());
        for hour in 0..24 {
            assert_eq!(schedule.for_hour(hour), ThresholdSet::default());
        }
    }

    #[test]
    fn window_overrides_only_named_fields() {
        let schedule = ThresholdSchedule::new(ThresholdSet::default(), vec![business_hours()]);

        let peak = schedule.for_hour(10);
        assert_eq!(peak.cpu_up, 60.0);
        assert_eq!(peak.memory_up, 75.0);
        assert_eq!(peak.extreme_cpu, 85.0);

        assert_eq!(schedule.for_hour(18).cpu_up, 70.0);
        assert_eq!(schedule.for_hour(8).cpu_up, 70.0);
    }

    #[test]
    fn window_wraps_midnight() {
        let night = ThresholdWindow {
            start_hour: 22,
            end_hour: 6,
            cpu_down: Some(40.0),
            ..Default::default()
        };
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(night.contains(5));
        assert!(!night.contains(6));
        assert!(!night.contains(12));
    }

    #[test]
    fn first_matching_window_wins() {
        let overlapping = ThresholdWindow {
            start_hour: 0,
            end_hour: 24,
            cpu_up: Some(90.0),
            ..Default::default()
        };
        let schedule =
            ThresholdSchedule::new(ThresholdSet::default(), vec![business_hours(), overlapping]);
        assert_eq!(schedule.for_hour(12).cpu_up, 60.0);
        assert_eq!(schedule.for_hour(20).cpu_up, 90.0);
    }
}
