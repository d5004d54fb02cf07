//! In-memory compute platform and workload scheduler.
//!
//! Backs the unit and integration tests and `nodefleetd --simulate`.
//! Failure modes are switched on per test: capacity rejection by class,
//! throttled launches, nodes that never join, disruption budgets, cordon
//! errors, spot interruption notices, and drains that fail or hang.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use nodefleet_core::BoxFuture;

use crate::error::{LifecycleError, LifecycleResult};
use crate::provider::{ComputeProvider, WorkloadScheduler};
use crate::types::{
    INTERRUPTION_TAG, JOIN_FAILED, LaunchRequest, LifecycleClass, NodeRecord, NodeStatus, STATUS_TAG, SchedulerNode,
    TAG_TRUE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainBehavior {
    #[default]
    Succeed,
    Fail,
    /// Never completes within the drain timeout.
    Hang,
}

#[derive(Debug, Clone)]
struct SimNode {
    record: NodeRecord,
    /// Readiness polls still answered with `false`.
    polls_until_ready: u32,
    never_joins: bool,
    schedulable: bool,
    critical: bool,
    budget_blocked: bool,
    work_items: u32,
    idle_percent: f64,
}

impl SimNode {
    fn scheduler_view(&self) -> SchedulerNode {
        SchedulerNode {
            name: node_name(&self.record.instance_id),
            instance_id: self.record.instance_id.clone(),
            ready: self.record.status == NodeStatus::Ready,
            schedulable: self.schedulable,
            has_critical_workloads: self.critical,
            work_items: self.work_items,
            idle_percent: self.idle_percent,
        }
    }
}

#[derive(Debug, Default)]
struct Fleet {
    nodes: BTreeMap<String, SimNode>,
    next_id: u32,
    rejected: HashSet<LifecycleClass>,
    throttled_launches: u32,
    failing_joins: u32,
    ready_after_polls: u32,
    drain: DrainBehavior,
    launch_delay: Duration,
    failing_cordons: u32,
    launches: Vec<LaunchRequest>,
    terminated: Vec<String>,
}

/// Simulated cluster implementing [`ComputeProvider`] and [`WorkloadScheduler`].
#[derive(Debug, Default)]
pub struct SimulatedFleet {
    fleet: Mutex<Fleet>,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

fn node_name(instance_id: &str) -> String {
    format!("node-{instance_id}")
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn fleet(&self) -> MutexGuard<'_, Fleet> {
        self.fleet.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a ready node and return its instance id.
    pub fn seed_node(&self, zone: &str, class: LifecycleClass) -> String {
        let mut fleet = self.fleet();
        let id = next_instance_id(&mut fleet);
        let node = new_node(&id, zone, class, NodeStatus::Ready);
        fleet.nodes.insert(id.clone(), node);
        id
    }

    pub fn set_ready_after_polls(&self, polls: u32) {
        self.fleet().ready_after_polls = polls;
    }

    /// The next `n` launched nodes never become ready.
    pub fn fail_next_joins(&self, n: u32) {
        self.fleet().failing_joins = n;
    }

    pub fn reject_capacity(&self, class: LifecycleClass) {
        self.fleet().rejected.insert(class);
    }

    pub fn throttle_next_launches(&self, n: u32) {
        self.fleet().throttled_launches = n;
    }

    pub fn set_drain_behavior(&self, behavior: DrainBehavior) {
        self.fleet().drain = behavior;
    }

    /// Hold each launch call open for `delay` before answering.
    pub fn set_launch_delay(&self, delay: Duration) {
        self.fleet().launch_delay = delay;
    }

    /// The next `n` cordon calls take effect but report an API error.
    pub fn fail_next_cordons(&self, n: u32) {
        self.fleet().failing_cordons = n;
    }

    /// Post the platform's reclaim notice on a spot node.
    pub fn interrupt(&self, instance_id: &str) {
        if let Some(node) = self.fleet().nodes.get_mut(instance_id) {
            node.record.tags.insert(INTERRUPTION_TAG.to_string(), TAG_TRUE.to_string());
        }
    }

    pub fn block_budget(&self, instance_id: &str) {
        if let Some(node) = self.fleet().nodes.get_mut(instance_id) {
            node.budget_blocked = true;
        }
    }

    pub fn mark_critical(&self, instance_id: &str) {
        if let Some(node) = self.fleet().nodes.get_mut(instance_id) {
            node.critical = true;
        }
    }

    pub fn set_load(&self, instance_id: &str, idle_percent: f64, work_items: u32) {
        if let Some(node) = self.fleet().nodes.get_mut(instance_id) {
            node.idle_percent = idle_percent;
            node.work_items = work_items;
        }
    }

    /// Ready, non-terminated nodes.
    pub fn active_count(&self) -> u32 {
        self.fleet()
            .nodes
            .values()
            .filter(|n| n.record.status == NodeStatus::Ready)
            .count() as u32
    }

    pub fn node(&self, instance_id: &str) -> Option<NodeRecord> {
        self.fleet().nodes.get(instance_id).map(|n| n.record.clone())
    }

    pub fn is_cordoned(&self, instance_id: &str) -> bool {
        self.fleet()
            .nodes
            .get(instance_id)
            .is_some_and(|n| !n.schedulable)
    }

    pub fn tags(&self, instance_id: &str) -> BTreeMap<String, String> {
        self.fleet()
            .nodes
            .get(instance_id)
            .map(|n| n.record.tags.clone())
            .unwrap_or_default()
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.fleet().launches.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.fleet().terminated.clone()
    }

    /// Highest number of launch/drain/terminate calls ever overlapping.
    pub fn max_concurrent_side_effects(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    fn launch_now(&self, request: &LaunchRequest) -> LifecycleResult<Vec<NodeRecord>> {
        let mut fleet = self.fleet();
        fleet.launches.push(request.clone());

        if fleet.throttled_launches > 0 {
            fleet.throttled_launches -= 1;
            return Err(LifecycleError::Throttled("request limit exceeded".into()));
        }
        if fleet.rejected.contains(&request.class) {
            return Err(LifecycleError::CapacityRejected {
                class: request.class,
                zone: request.zone.clone(),
            });
        }

        let mut records = Vec::with_capacity(request.count as usize);
        for _ in 0..request.count {
            let id = next_instance_id(&mut fleet);
            let mut node = new_node(&id, &request.zone, request.class, NodeStatus::Provisioning);
            node.polls_until_ready = fleet.ready_after_polls;
            if fleet.failing_joins > 0 {
                fleet.failing_joins -= 1;
                node.never_joins = true;
            }
            records.push(node.record.clone());
            fleet.nodes.insert(id, node);
        }
        Ok(records)
    }
}

struct InFlight<'a>(&'a SimulatedFleet);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn next_instance_id(fleet: &mut Fleet) -> String {
    fleet.next_id += 1;
    format!("i-{:06}", fleet.next_id)
}

fn new_node(id: &str, zone: &str, class: LifecycleClass, status: NodeStatus) -> SimNode {
    SimNode {
        record: NodeRecord {
            instance_id: id.to_string(),
            availability_zone: zone.to_string(),
            lifecycle_class: class,
            launch_time: nodefleet_core::epoch_secs(),
            status,
            tags: BTreeMap::new(),
        },
        polls_until_ready: 0,
        never_joins: false,
        schedulable: true,
        critical: false,
        budget_blocked: false,
        work_items: 0,
        idle_percent: 50.0,
    }
}

impl ComputeProvider for SimulatedFleet {
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BoxFuture<'a, LifecycleResult<Vec<NodeRecord>>> {
        Box::pin(async move {
            let _guard = self.enter();
            let delay = self.fleet().launch_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.launch_now(request)
        })
    }

    fn terminate<'a>(&'a self, instance_ids: &'a [String]) -> BoxFuture<'a, LifecycleResult<()>> {
        Box::pin(async move {
            let _guard = self.enter();
            self.terminate_now(instance_ids)
        })
    }

    fn describe<'a>(&'a self, instance_ids: &'a [String]) -> BoxFuture<'a, LifecycleResult<Vec<NodeRecord>>> {
        Box::pin(async move { self.describe_now(instance_ids) })
    }

    fn list_workers(&self) -> BoxFuture<'_, LifecycleResult<Vec<NodeRecord>>> {
        Box::pin(async move { Ok(self.workers_now()) })
    }

    fn tag<'a>(&'a self, instance_id: &'a str, key: &'a str, value: &'a str) -> BoxFuture<'a, LifecycleResult<()>> {
        Box::pin(async move { self.tag_now(instance_id, key, value) })
    }
}

impl WorkloadScheduler for SimulatedFleet {
    fn list_nodes(&self) -> BoxFuture<'_, LifecycleResult<Vec<SchedulerNode>>> {
        Box::pin(async move { Ok(self.scheduler_nodes_now()) })
    }

    fn node_ready<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, LifecycleResult<bool>> {
        Box::pin(async move { self.node_ready_now(instance_id) })
    }

    fn cordon<'a>(&'a self, node: &'a str) -> BoxFuture<'a, LifecycleResult<()>> {
        Box::pin(async move { self.cordon_now(node) })
    }

    fn uncordon<'a>(&'a self, node: &'a str) -> BoxFuture<'a, LifecycleResult<()>> {
        Box::pin(async move { self.set_schedulable(node, true) })
    }

    fn drain<'a>(&'a self, node: &'a str, timeout: Duration) -> BoxFuture<'a, LifecycleResult<bool>> {
        Box::pin(async move {
            let _guard = self.enter();
            let behavior = self.fleet().drain;
            match behavior {
                DrainBehavior::Succeed => self.evict_now(node),
                DrainBehavior::Fail => Ok(false),
                DrainBehavior::Hang => {
                    tokio::time::sleep(timeout * 2).await;
                    Ok(false)
                }
            }
        })
    }

    fn disruption_budget_would_be_violated<'a>(&'a self, node: &'a str) -> BoxFuture<'a, LifecycleResult<bool>> {
        Box::pin(async move { self.budget_blocked_now(node) })
    }
}

// Synchronous bodies of the trait calls.
impl SimulatedFleet {
    fn terminate_now(&self, instance_ids: &[String]) -> LifecycleResult<()> {
        let mut fleet = self.fleet();
        if let Some(missing) = instance_ids.iter().find(|id| !fleet.nodes.contains_key(id.as_str())) {
            return Err(LifecycleError::NotFound(missing.clone()));
        }
        for id in instance_ids {
            if let Some(node) = fleet.nodes.get_mut(id) {
                node.record.status = NodeStatus::Terminated;
            }
            fleet.terminated.push(id.clone());
        }
        Ok(())
    }

    fn describe_now(&self, instance_ids: &[String]) -> LifecycleResult<Vec<NodeRecord>> {
        let fleet = self.fleet();
        instance_ids
            .iter()
            .map(|id| {
                fleet
                    .nodes
                    .get(id)
                    .map(|n| n.record.clone())
                    .ok_or_else(|| LifecycleError::NotFound(id.clone()))
            })
            .collect()
    }

    fn workers_now(&self) -> Vec<NodeRecord> {
        self.fleet()
            .nodes
            .values()
            .filter(|n| n.record.status.is_active())
            .map(|n| n.record.clone())
            .collect()
    }

    fn tag_now(&self, instance_id: &str, key: &str, value: &str) -> LifecycleResult<()> {
        let mut fleet = self.fleet();
        let node = fleet
            .nodes
            .get_mut(instance_id)
            .ok_or_else(|| LifecycleError::NotFound(instance_id.to_string()))?;
        node.record.tags.insert(key.to_string(), value.to_string());
        if key == STATUS_TAG && value == JOIN_FAILED {
            node.record.status = NodeStatus::JoinFailed;
        }
        Ok(())
    }

    fn scheduler_nodes_now(&self) -> Vec<SchedulerNode> {
        self.fleet()
            .nodes
            .values()
            .filter(|n| n.record.status.is_active())
            .map(SimNode::scheduler_view)
            .collect()
    }

    fn node_ready_now(&self, instance_id: &str) -> LifecycleResult<bool> {
        let mut fleet = self.fleet();
        let node = fleet
            .nodes
            .get_mut(instance_id)
            .ok_or_else(|| LifecycleError::NotFound(instance_id.to_string()))?;
        match node.record.status {
            NodeStatus::Ready => Ok(true),
            NodeStatus::Provisioning if node.never_joins => Ok(false),
            NodeStatus::Provisioning if node.polls_until_ready > 0 => {
                node.polls_until_ready -= 1;
                Ok(false)
            }
            NodeStatus::Provisioning => {
                node.record.status = NodeStatus::Ready;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn cordon_now(&self, node: &str) -> LifecycleResult<()> {
        let mut fleet = self.fleet();
        find_by_name(&mut fleet, node)?.schedulable = false;
        if fleet.failing_cordons > 0 {
            fleet.failing_cordons -= 1;
            return Err(LifecycleError::Api(format!("cordon {node}: connection reset")));
        }
        Ok(())
    }

    fn set_schedulable(&self, node: &str, schedulable: bool) -> LifecycleResult<()> {
        let mut fleet = self.fleet();
        find_by_name(&mut fleet, node)?.schedulable = schedulable;
        Ok(())
    }

    fn evict_now(&self, node: &str) -> LifecycleResult<bool> {
        let mut fleet = self.fleet();
        let sim = find_by_name(&mut fleet, node)?;
        sim.work_items = 0;
        sim.record.status = NodeStatus::Draining;
        Ok(true)
    }

    fn budget_blocked_now(&self, node: &str) -> LifecycleResult<bool> {
        let mut fleet = self.fleet();
        Ok(find_by_name(&mut fleet, node)?.budget_blocked)
    }
}

fn find_by_name<'a>(fleet: &'a mut Fleet, name: &str) -> LifecycleResult<&'a mut SimNode> {
    let id = name.strip_prefix("node-").unwrap_or(name);
    fleet
        .nodes
        .get_mut(id)
        .ok_or_else(|| LifecycleError::NotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launched_nodes_join_after_polls() {
        let fleet = SimulatedFleet::new();
        fleet.set_ready_after_polls(1);
        let request = LaunchRequest {
            template: "worker-spot".into(),
            zone: "zone-a".into(),
            class: LifecycleClass::Spot,
            count: 1,
        };

        let records = fleet.launch(&request).await.unwrap();
        let id = &records[0].instance_id;
        assert_eq!(records[0].status, NodeStatus::Provisioning);
        assert!(!fleet.node_ready(id).await.unwrap());
        assert!(fleet.node_ready(id).await.unwrap());
        assert_eq!(fleet.active_count(), 1);
    }

    #[tokio::test]
    async fn cordon_and_terminate() {
        let fleet = SimulatedFleet::new();
        let id = fleet.seed_node("zone-a", LifecycleClass::OnDemand);
        let name = node_name(&id);

        fleet.cordon(&name).await.unwrap();
        assert!(fleet.is_cordoned(&id));
        fleet.uncordon(&name).await.unwrap();
        assert!(!fleet.is_cordoned(&id));

        fleet.terminate(std::slice::from_ref(&id)).await.unwrap();
        assert!(fleet.list_workers().await.unwrap().is_empty());
        assert!(fleet.list_nodes().await.unwrap().is_empty());
        assert!(fleet.terminate(&["i-missing".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn failed_cordon_still_takes_effect() {
        let fleet = SimulatedFleet::new();
        let id = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.fail_next_cordons(1);

        assert!(fleet.cordon(&node_name(&id)).await.is_err());
        assert!(fleet.is_cordoned(&id));
        fleet.cordon(&node_name(&id)).await.unwrap();
    }

    #[tokio::test]
    async fn interruption_notice_shows_in_worker_tags() {
        let fleet = SimulatedFleet::new();
        let id = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.interrupt(&id);

        let workers = fleet.list_workers().await.unwrap();
        assert!(workers[0].has_pending_interruption());
    }

    #[tokio::test]
    async fn describe_unknown_instance_is_not_found() {
        let fleet = SimulatedFleet::new();
        let err = fleet.describe(&["i-404".to_string()]).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }
}
