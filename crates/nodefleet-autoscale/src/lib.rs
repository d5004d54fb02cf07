//! nodefleet-autoscale — the scaling decision engine.
//!
//! A pure function from the current reading, the bounded history and the
//! cooldown bookkeeping to a [`ScalingDecision`]. No I/O happens here; the
//! orchestrator gathers the inputs and carries out the result.
//!
//! # Evaluation order
//!
//! ```text
//! node_count < min_nodes            → scale_up (min - count), bypasses cooldown
//! node_count > max_nodes            → scale_down 1, bypasses cooldown
//! any scale-up trigger:
//!     cpu >= cpu_up       sustained scale_up_readings
//!     memory >= memory_up sustained scale_up_readings
//!     pending > 0         immediate
//!     custom > limit      immediate
//!     forecast > up       late-hour window only, if nothing above fired
//!   node_count >= max     → no_action "at capacity"
//!   scale-up cooldown     → no_action "cooldown"
//!   else                  → scale_up 1 (2 when extreme), capped at max
//! cpu < down AND memory < down AND pending == 0, sustained scale_down_readings:
//!   node_count <= min     → no_action "minimum"
//!   scale-down cooldown   → no_action "cooldown"
//!   else                  → scale_down 1
//! otherwise               → no_action
//! ```

pub mod engine;
pub mod forecast;

pub use engine::{
    DecisionAction, DecisionEngine, DecisionInput, EngineConfig, MIN_FORECAST_CONFIDENCE, ScalingDecision,
};
pub use forecast::HourlyForecast;
