//! Adaptive trigger interval from recent scaling activity.

use std::time::Duration;

use nodefleet_core::config::ScheduleConfig;
use nodefleet_state::{MetricsHistory, ScalingEvent};

/// Look-back for activity assessment.
pub const ACTIVITY_WINDOW_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityLevel {
    High,
    Normal,
    Low,
}

/// Classify recent activity.
///
/// High: three or more scaling actions in the window, or CPU standard
/// deviation above 20 points. Low: no actions and deviation below 5.
pub fn assess_activity(events: &[ScalingEvent], history: &MetricsHistory, now: u64) -> ActivityLevel {
    let since = now.saturating_sub(ACTIVITY_WINDOW_SECS);
    let actions = events
        .iter()
        .filter(|e| e.timestamp >= since && e.kind.is_action())
        .count();

    let cpu: Vec<f64> = history
        .iter()
        .filter(|s| s.timestamp >= since)
        .map(|s| s.cpu_percent)
        .collect();
    let volatility = std_dev(&cpu);

    if actions >= 3 || volatility > 20.0 {
        ActivityLevel::High
    } else if actions == 0 && volatility < 5.0 {
        ActivityLevel::Low
    } else {
        ActivityLevel::Normal
    }
}

/// Interval until the next cycle.
pub fn next_interval(level: ActivityLevel, config: &ScheduleConfig) -> Duration {
    if !config.adaptive {
        return config.interval_duration();
    }
    match level {
        ActivityLevel::High => config.min_interval_duration(),
        ActivityLevel::Normal => config.interval_duration(),
        ActivityLevel::Low => config.max_interval_duration(),
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodefleet_state::{EventKind, MetricsSnapshot};

    const NOW: u64 = 100_000;

    fn steady_history(cpu: &[f64]) -> MetricsHistory {
        let mut history = MetricsHistory::with_capacity(cpu.len());
        cpu.iter()
            .enumerate()
            .map(|(i, c)| MetricsSnapshot::new(NOW - 600 + i as u64 * 120, *c, 40.0, 0, 3))
            .for_each(|s| history.push(s));
        history
    }

    fn action(ts: u64) -> ScalingEvent {
        ScalingEvent::new(EventKind::ScaleUp, "c1", 1, "cpu", ts)
    }

    #[test]
    fn many_recent_actions_are_high() {
        let events = vec![action(NOW - 60), action(NOW - 600), action(NOW - 1200)];
        let level = assess_activity(&events, &steady_history(&[50.0, 51.0]), NOW);
        assert_eq!(level, ActivityLevel::High);
    }

    #[test]
    fn old_actions_do_not_count() {
        let events = vec![action(NOW - 4000), action(NOW - 5000), action(NOW - 6000)];
        let level = assess_activity(&events, &steady_history(&[50.0, 51.0, 50.5]), NOW);
        assert_eq!(level, ActivityLevel::Low);
    }

    #[test]
    fn volatile_cpu_is_high() {
        let level = assess_activity(&[], &steady_history(&[10.0, 80.0, 15.0, 90.0]), NOW);
        assert_eq!(level, ActivityLevel::High);
    }

    #[test]
    fn diagnostics_are_not_actions() {
        let events = vec![ScalingEvent::new(EventKind::SafetyBlocked, "c1", 0, "budget", NOW - 10)];
        let level = assess_activity(&events, &steady_history(&[50.0, 50.0]), NOW);
        assert_eq!(level, ActivityLevel::Low);
    }

    #[test]
    fn interval_follows_level_only_when_adaptive() {
        let mut config = ScheduleConfig::default();
        assert_eq!(next_interval(ActivityLevel::High, &config), Duration::from_secs(120));

        config.adaptive = true;
        assert_eq!(next_interval(ActivityLevel::High, &config), Duration::from_secs(60));
        assert_eq!(next_interval(ActivityLevel::Normal, &config), Duration::from_secs(120));
        assert_eq!(next_interval(ActivityLevel::Low, &config), Duration::from_secs(300));
    }
}
