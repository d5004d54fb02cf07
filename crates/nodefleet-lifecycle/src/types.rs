//! Node records as seen by the compute platform and the workload scheduler.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag key written on nodes the lifecycle manager gave up on.
pub const STATUS_TAG: &str = "nodefleet/status";
pub const JOIN_FAILED: &str = "join_failed";

/// Set to `"true"` by the platform when a spot node is about to be reclaimed.
pub const INTERRUPTION_TAG: &str = "nodefleet/spot-interruption";
/// Set to `"true"` once the interruption has been acted on.
pub const INTERRUPTION_HANDLED_TAG: &str = "nodefleet/spot-interruption-handled";
/// Epoch seconds at which the interruption was handled.
pub const INTERRUPTION_TIME_TAG: &str = "nodefleet/interruption-time";
pub const TAG_TRUE: &str = "true";

/// Pricing/availability category of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleClass {
    Spot,
    OnDemand,
}

impl LifecycleClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleClass::Spot => "spot",
            LifecycleClass::OnDemand => "on_demand",
        }
    }

    /// The fallback class when this one has no capacity.
    pub fn other(&self) -> Self {
        match self {
            LifecycleClass::Spot => LifecycleClass::OnDemand,
            LifecycleClass::OnDemand => LifecycleClass::Spot,
        }
    }
}

impl fmt::Display for LifecycleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Provisioning,
    Ready,
    /// Did not become ready in time; left running for inspection.
    JoinFailed,
    Draining,
    Terminated,
}

impl NodeStatus {
    /// Whether the node still occupies capacity in its zone.
    pub fn is_active(&self) -> bool {
        !matches!(self, NodeStatus::Terminated)
    }
}

/// A worker instance. Owned by the compute platform; this crate only
/// refers to it by `instance_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub instance_id: String,
    pub availability_zone: String,
    pub lifecycle_class: LifecycleClass,
    pub launch_time: u64,
    pub status: NodeStatus,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl NodeRecord {
    fn tag_is_true(&self, key: &str) -> bool {
        self.tags.get(key).is_some_and(|v| v == TAG_TRUE)
    }

    /// A running spot node with an interruption notice nobody acted on yet.
    pub fn has_pending_interruption(&self) -> bool {
        self.lifecycle_class == LifecycleClass::Spot
            && self.status == NodeStatus::Ready
            && self.tag_is_true(INTERRUPTION_TAG)
            && !self.tag_is_true(INTERRUPTION_HANDLED_TAG)
    }
}

/// Workload-scheduler view of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerNode {
    /// Scheduler-side node name.
    pub name: String,
    /// Backing compute instance.
    pub instance_id: String,
    pub ready: bool,
    /// False once cordoned.
    pub schedulable: bool,
    /// Runs system workloads that must not be disrupted.
    pub has_critical_workloads: bool,
    /// Work items currently placed on the node.
    pub work_items: u32,
    /// Unused share of the node's resources (0-100).
    pub idle_percent: f64,
}

/// One provisioning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub template: String,
    pub zone: String,
    pub class: LifecycleClass,
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot(status: NodeStatus) -> NodeRecord {
        NodeRecord {
            instance_id: "i-1".into(),
            availability_zone: "zone-a".into(),
            lifecycle_class: LifecycleClass::Spot,
            launch_time: 0,
            status,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn interruption_notice_needs_running_spot_node() {
        let mut node = spot(NodeStatus::Ready);
        assert!(!node.has_pending_interruption());

        node.tags.insert(INTERRUPTION_TAG.into(), TAG_TRUE.into());
        assert!(node.has_pending_interruption());

        node.status = NodeStatus::Draining;
        assert!(!node.has_pending_interruption());
        node.status = NodeStatus::Ready;

        node.lifecycle_class = LifecycleClass::OnDemand;
        assert!(!node.has_pending_interruption());
        node.lifecycle_class = LifecycleClass::Spot;

        node.tags.insert(INTERRUPTION_HANDLED_TAG.into(), TAG_TRUE.into());
        assert!(!node.has_pending_interruption());
    }

    #[test]
    fn records_without_tags_deserialize() {
        let json = r#"{"instance_id":"i-1","availability_zone":"zone-a","lifecycle_class":"spot","launch_time":5,"status":"ready"}"#;
        let node: NodeRecord = serde_json::from_str(json).unwrap();
        assert!(node.tags.is_empty());
    }
}
