//! nodefleet-core — shared building blocks for the NodeFleet autoscaler.
//!
//! Holds the `nodefleet.toml` configuration model, duration parsing,
//! time-of-day threshold schedules, and the epoch/clock helpers every
//! other crate uses. Timestamps throughout the workspace are unix
//! seconds (`u64`).

pub mod clock;
pub mod config;
pub mod duration;
pub mod schedule;

use std::future::Future;
use std::pin::Pin;

pub use clock::{epoch_secs, hour_of_day, minute_of_hour};
pub use config::{ConfigError, FleetConfig};
pub use duration::parse_duration;
pub use schedule::{ThresholdSchedule, ThresholdSet, ThresholdWindow};

/// Boxed, sendable future used at the external-collaborator trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
