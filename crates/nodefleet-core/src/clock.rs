//! Wall-clock helpers over unix-second timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Timelike};

/// Current time as unix seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// UTC hour of day (0-23) for a unix timestamp.
pub fn hour_of_day(ts: u64) -> u32 {
    DateTime::from_timestamp(ts as i64, 0)
        .map(|t| t.hour())
        .unwrap_or(0)
}

/// UTC minute within the hour (0-59) for a unix timestamp.
pub fn minute_of_hour(ts: u64) -> u32 {
    DateTime::from_timestamp(ts as i64, 0)
        .map(|t| t.minute())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_and_minute_from_epoch() {
        // 1970-01-02T13:52:00Z
        let ts = 86_400 + 13 * 3600 + 52 * 60;
        assert_eq!(hour_of_day(ts), 13);
        assert_eq!(minute_of_hour(ts), 52);
    }

    #[test]
    fn epoch_zero_is_midnight() {
        assert_eq!(hour_of_day(0), 0);
        assert_eq!(minute_of_hour(0), 0);
    }

    #[test]
    fn epoch_secs_is_recent() {
        // Any sane clock is past 2020-01-01.
        assert!(epoch_secs() > 1_577_836_800);
    }
}
