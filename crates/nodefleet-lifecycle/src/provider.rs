//! Seams to the compute platform and the workload scheduler.

use std::time::Duration;

use nodefleet_core::BoxFuture;

use crate::error::LifecycleResult;
use crate::types::{LaunchRequest, NodeRecord, SchedulerNode};

/// Compute provisioning API.
pub trait ComputeProvider: Send + Sync {
    /// Launch instances; returned records are in `Provisioning`.
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BoxFuture<'a, LifecycleResult<Vec<NodeRecord>>>;

    fn terminate<'a>(&'a self, instance_ids: &'a [String]) -> BoxFuture<'a, LifecycleResult<()>>;

    fn describe<'a>(&'a self, instance_ids: &'a [String]) -> BoxFuture<'a, LifecycleResult<Vec<NodeRecord>>>;

    /// All worker instances managed for this cluster that are not terminated.
    fn list_workers(&self) -> BoxFuture<'_, LifecycleResult<Vec<NodeRecord>>>;

    fn tag<'a>(&'a self, instance_id: &'a str, key: &'a str, value: &'a str) -> BoxFuture<'a, LifecycleResult<()>>;
}

/// Workload scheduler node control API.
pub trait WorkloadScheduler: Send + Sync {
    fn list_nodes(&self) -> BoxFuture<'_, LifecycleResult<Vec<SchedulerNode>>>;

    /// Whether the node backed by `instance_id` has joined and is schedulable.
    fn node_ready<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, LifecycleResult<bool>>;

    fn cordon<'a>(&'a self, node: &'a str) -> BoxFuture<'a, LifecycleResult<()>>;

    fn uncordon<'a>(&'a self, node: &'a str) -> BoxFuture<'a, LifecycleResult<()>>;

    /// Evict the node's work items. `Ok(false)` means eviction did not finish.
    fn drain<'a>(&'a self, node: &'a str, timeout: Duration) -> BoxFuture<'a, LifecycleResult<bool>>;

    fn disruption_budget_would_be_violated<'a>(&'a self, node: &'a str) -> BoxFuture<'a, LifecycleResult<bool>>;
}
