//! Hour-of-day load forecast from the metrics archive.

use serde::{Deserialize, Serialize};

use nodefleet_core::hour_of_day;
use nodefleet_state::MetricsSnapshot;

/// Average load historically observed in one hour of the day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecast {
    /// Hour of day (0-23, UTC) the forecast describes.
    pub hour: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Archived readings the averages were computed from.
    pub samples: usize,
}

impl HourlyForecast {
    /// Average the archived readings taken during `target_hour` at or after
    /// `since`. Returns `None` with fewer than `min_samples` matches.
    pub fn from_archive(
        samples: &[MetricsSnapshot],
        target_hour: u32,
        since: u64,
        min_samples: usize,
    ) -> Option<Self> {
        let (count, cpu, memory) = samples
            .iter()
            .filter(|s| s.timestamp >= since && hour_of_day(s.timestamp) == target_hour)
            .fold((0usize, 0.0, 0.0), |(n, cpu, mem), s| {
                (n + 1, cpu + s.cpu_percent, mem + s.memory_percent)
            });

        if count == 0 || count < min_samples {
            return None;
        }

        Some(Self {
            hour: target_hour,
            cpu_percent: cpu / count as f64,
            memory_percent: memory / count as f64,
            samples: count,
        })
    }

    /// Sample-count confidence in `0.0..=1.0`, saturating at ten readings.
    pub fn confidence(&self) -> f64 {
        (self.samples as f64 / 10.0).min(1.0)
    }
}
