//! nodefleet-lifecycle — provisioning and retiring worker nodes.
//!
//! Executes scaling decisions against two external collaborators:
//!
//! - a [`ComputeProvider`] that launches, describes, tags and terminates
//!   instances, and
//! - a [`WorkloadScheduler`] that reports node readiness and can cordon,
//!   uncordon and drain nodes.
//!
//! # Provision
//!
//! ```text
//! plan placements (fewest-nodes zone, spot up to the target ratio)
//!   └── launch each (throttled → retry, capacity rejected → other class)
//!         └── poll readiness until the deadline
//!               ├── ready       → counted
//!               └── not ready   → tagged join_failed, left running
//! ```
//!
//! # Deprovision
//!
//! ```text
//! rank candidates (no critical workloads; busiest zone, spot, idle, fewest items)
//!   └── disruption budget ok? ── no → blocked
//!         └── cordon → drain (bounded)
//!               ├── drained  → terminate
//!               └── failed   → uncordon, blocked
//! ```
//!
//! # Spot interruption
//!
//! ```text
//! running spot workers tagged with a reclaim notice, not yet handled
//!   └── tag handled + time → cordon → drain (bounded)
//!         ├── drained  → terminate
//!         └── failed   → left cordoned for the platform to reclaim
//!   └── plan one replacement each, ignoring the interrupted nodes
//! ```

pub mod error;
pub mod manager;
pub mod placement;
pub mod provider;
pub mod removal;
pub mod simulated;
pub mod types;
pub mod wait;

pub use error::{LifecycleError, LifecycleResult};
pub use manager::{
    BlockReason, DeprovisionOutcome, InterruptionReport, LifecycleSettings, NodeLifecycleManager, ProvisionReport,
};
pub use placement::{Placement, PlacementPlanner};
pub use provider::{ComputeProvider, WorkloadScheduler};
pub use removal::{RemovalCandidate, rank_removal_candidates};
pub use simulated::SimulatedFleet;
pub use types::*;
pub use wait::{WaitOutcome, poll_until};
