//! nodefleet-metrics — cluster load collection for the scaling loop.
//!
//! Queries an external time-series service for the four core cluster
//! signals plus any configured application signals and normalizes them
//! into a [`MetricsSnapshot`](nodefleet_state::MetricsSnapshot).
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── collect(now) → MetricsSnapshot | MetricsError
//!   │   ├── cpu / memory / unschedulable / ready nodes (concurrent)
//!   │   │     each: timeout → retry × N with fixed backoff
//!   │   └── custom signals (a failure drops only that signal)
//!   └── MetricsSource (trait)
//!         ├── PrometheusSource  — POST /api/v1/query over hyper
//!         └── StaticSource      — in-memory values for tests and dry runs
//! ```

pub mod collector;
pub mod error;
pub mod prometheus;
pub mod source;

pub use collector::{CustomQuery, MetricsCollector, QuerySet};
pub use error::{MetricsError, MetricsErrorKind, MetricsResult};
pub use prometheus::PrometheusSource;
pub use source::{MetricsSource, StaticSource};
