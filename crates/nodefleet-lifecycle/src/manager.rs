//! Node lifecycle manager — carries out scale-up and scale-down.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use nodefleet_core::FleetConfig;

use crate::error::{LifecycleError, LifecycleResult};
use crate::placement::{Placement, PlacementPlanner};
use crate::provider::{ComputeProvider, WorkloadScheduler};
use crate::removal::rank_removal_candidates;
use crate::types::{
    INTERRUPTION_HANDLED_TAG, INTERRUPTION_TIME_TAG, JOIN_FAILED, LaunchRequest, LifecycleClass, NodeRecord,
    NodeStatus, STATUS_TAG, TAG_TRUE,
};
use crate::wait::{WaitOutcome, poll_until};

/// Timeouts, retry policy and launch templates.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    pub spot_template: String,
    pub on_demand_template: String,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub drain_timeout: Duration,
    pub launch_retries: u32,
    pub launch_backoff: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            spot_template: "worker-spot".to_string(),
            on_demand_template: "worker-on-demand".to_string(),
            ready_timeout: Duration::from_secs(300),
            ready_poll_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(300),
            launch_retries: 2,
            launch_backoff: Duration::from_secs(2),
        }
    }
}

impl LifecycleSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            spot_template: config.placement.spot_template.clone(),
            on_demand_template: config.placement.on_demand_template.clone(),
            ready_timeout: config.lifecycle.ready_timeout_duration(),
            ready_poll_interval: config.lifecycle.ready_poll_interval_duration(),
            drain_timeout: config.lifecycle.drain_timeout_duration(),
            launch_retries: config.lifecycle.launch_retries,
            launch_backoff: config.lifecycle.launch_backoff_duration(),
        }
    }

    fn template_for(&self, class: LifecycleClass) -> &str {
        match class {
            LifecycleClass::Spot => &self.spot_template,
            LifecycleClass::OnDemand => &self.on_demand_template,
        }
    }
}

/// What a provisioning pass achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionReport {
    pub requested: u32,
    /// Nodes that reached ready within the timeout.
    pub ready: Vec<NodeRecord>,
    /// Launched nodes that never became ready; tagged and left running.
    pub join_failed: Vec<NodeRecord>,
    /// Launch calls that failed outright.
    pub launch_failures: Vec<String>,
}

impl ProvisionReport {
    fn new(requested: u32) -> Self {
        Self {
            requested,
            ..Default::default()
        }
    }

    pub fn ready_count(&self) -> u32 {
        self.ready.len() as u32
    }

    /// Whether any provisioning call produced an instance.
    pub fn launched_any(&self) -> bool {
        !self.ready.is_empty() || !self.join_failed.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        self.ready_count() < self.requested
    }
}

/// Why a scale-down was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Every node runs critical workloads or is otherwise ineligible.
    NoCandidate,
    DisruptionBudget,
    DrainFailed,
    DrainTimedOut,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::NoCandidate => "no removable node",
            BlockReason::DisruptionBudget => "disruption budget would be violated",
            BlockReason::DrainFailed => "drain failed",
            BlockReason::DrainTimedOut => "drain timed out",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeprovisionOutcome {
    Removed(NodeRecord),
    Blocked {
        reason: BlockReason,
        /// Scheduler node name, when a candidate had been chosen.
        node: Option<String>,
    },
}

impl DeprovisionOutcome {
    fn blocked(reason: BlockReason, node: Option<&str>) -> Self {
        DeprovisionOutcome::Blocked {
            reason,
            node: node.map(str::to_string),
        }
    }
}

/// What handling spot interruption notices achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterruptionReport {
    /// Nodes marked handled. Each counts as lost capacity.
    pub interrupted: Vec<NodeRecord>,
    /// Interrupted nodes whose drain did not finish.
    pub undrained: Vec<String>,
    pub replacements: ProvisionReport,
}

impl InterruptionReport {
    pub fn is_empty(&self) -> bool {
        self.interrupted.is_empty()
    }

    pub fn interrupted_count(&self) -> u32 {
        self.interrupted.len() as u32
    }
}

/// Executes provisioning and retirement against the external APIs.
pub struct NodeLifecycleManager {
    compute: Arc<dyn ComputeProvider>,
    scheduler: Arc<dyn WorkloadScheduler>,
    planner: PlacementPlanner,
    settings: LifecycleSettings,
}

impl NodeLifecycleManager {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        scheduler: Arc<dyn WorkloadScheduler>,
        planner: PlacementPlanner,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            compute,
            scheduler,
            planner,
            settings,
        }
    }

    pub fn from_config(
        compute: Arc<dyn ComputeProvider>,
        scheduler: Arc<dyn WorkloadScheduler>,
        config: &FleetConfig,
    ) -> Self {
        Self::new(
            compute,
            scheduler,
            PlacementPlanner::from_config(&config.placement),
            LifecycleSettings::from_config(config),
        )
    }

    /// Launch `count` nodes and wait for them to join.
    ///
    /// Errors only when no launch call succeeded at all; a partial batch is
    /// reported through [`ProvisionReport`].
    pub async fn provision(&self, count: u32) -> LifecycleResult<ProvisionReport> {
        let report = ProvisionReport::new(count);
        if count == 0 {
            return Ok(report);
        }

        let existing = self.compute.list_workers().await?;
        self.provision_plan(self.planner.plan(&existing, count), report).await
    }

    /// Launch the planned placements and wait for them to join.
    async fn provision_plan(&self, plan: Vec<Placement>, mut report: ProvisionReport) -> LifecycleResult<ProvisionReport> {
        let count = report.requested;
        let mut launched = Vec::new();
        let mut last_error = None;
        for placement in &plan {
            match self.launch_one(placement).await {
                Ok(records) => launched.extend(records),
                Err(e) => {
                    warn!(zone = %placement.zone, class = %placement.class, error = %e, "launch failed");
                    report.launch_failures.push(e.to_string());
                    last_error = Some(e);
                }
            }
        }

        if launched.is_empty() {
            return match last_error {
                Some(e) => Err(e),
                None => Ok(report),
            };
        }

        info!(launched = launched.len(), requested = count, "waiting for nodes to join");
        let (ready, not_ready) = self.await_ready(launched).await;

        for mut node in not_ready {
            node.status = NodeStatus::JoinFailed;
            if let Err(e) = self.compute.tag(&node.instance_id, STATUS_TAG, JOIN_FAILED).await {
                warn!(instance = %node.instance_id, error = %e, "failed to tag join-failed node");
            }
            warn!(
                instance = %node.instance_id,
                zone = %node.availability_zone,
                "node did not become ready, left running for inspection"
            );
            report.join_failed.push(node);
        }
        report.ready = ready;

        Ok(report)
    }

    /// Launch a single placement, falling back to the other class when
    /// capacity is rejected.
    async fn launch_one(&self, placement: &Placement) -> LifecycleResult<Vec<NodeRecord>> {
        match self.launch_with_retry(&placement.zone, placement.class).await {
            Err(LifecycleError::CapacityRejected { class, zone }) => {
                let fallback = class.other();
                info!(%zone, from = %class, to = %fallback, "capacity rejected, trying other class");
                self.launch_with_retry(&zone, fallback).await
            }
            other => other,
        }
    }

    async fn launch_with_retry(&self, zone: &str, class: LifecycleClass) -> LifecycleResult<Vec<NodeRecord>> {
        let request = LaunchRequest {
            template: self.settings.template_for(class).to_string(),
            zone: zone.to_string(),
            class,
            count: 1,
        };

        let mut attempt = 0;
        loop {
            match self.compute.launch(&request).await {
                Err(e) if e.is_transient() && attempt < self.settings.launch_retries => {
                    attempt += 1;
                    debug!(%zone, %class, attempt, error = %e, "launch throttled, backing off");
                    tokio::time::sleep(self.settings.launch_backoff).await;
                }
                result => return result,
            }
        }
    }

    /// Poll readiness until every node joined or the ready timeout passed.
    /// Returns `(ready, not_ready)`.
    async fn await_ready(&self, launched: Vec<NodeRecord>) -> (Vec<NodeRecord>, Vec<NodeRecord>) {
        let pending = Mutex::new(launched);
        let ready = Mutex::new(Vec::new());

        let outcome = {
            let (pending, ready, scheduler) = (&pending, &ready, &self.scheduler);
            poll_until(
                self.settings.ready_timeout,
                self.settings.ready_poll_interval,
                move || async move {
                    let ids: Vec<String> = lock(pending).iter().map(|n| n.instance_id.clone()).collect();

                    let mut joined = Vec::new();
                    for id in ids {
                        match scheduler.node_ready(&id).await {
                            Ok(true) => joined.push(id),
                            Ok(false) => {}
                            Err(e) => debug!(instance = %id, error = %e, "readiness check failed"),
                        }
                    }

                    let mut pending = lock(pending);
                    let mut ready = lock(ready);
                    pending.retain(|n| {
                        if joined.contains(&n.instance_id) {
                            let mut node = n.clone();
                            node.status = NodeStatus::Ready;
                            ready.push(node);
                            false
                        } else {
                            true
                        }
                    });
                    pending.is_empty()
                },
            )
            .await
        };

        if outcome == WaitOutcome::TimedOut {
            debug!(timeout = ?self.settings.ready_timeout, "ready wait timed out");
        }

        let ready = ready.into_inner().unwrap_or_else(|e| e.into_inner());
        let pending = pending.into_inner().unwrap_or_else(|e| e.into_inner());
        (ready, pending)
    }

    /// Retire one node, or report why none could be retired safely.
    pub async fn deprovision(&self) -> LifecycleResult<DeprovisionOutcome> {
        let nodes = self.scheduler.list_nodes().await?;
        let records = self.compute.list_workers().await?;

        let Some(candidate) = rank_removal_candidates(&nodes, &records).into_iter().next() else {
            warn!("no node can be removed safely");
            return Ok(DeprovisionOutcome::blocked(BlockReason::NoCandidate, None));
        };

        let name = candidate.node.name.as_str();
        let instance_id = candidate.record.instance_id.clone();
        debug!(
            node = %name,
            instance = %instance_id,
            zone = %candidate.record.availability_zone,
            class = %candidate.record.lifecycle_class,
            "selected node for removal"
        );

        if self.scheduler.disruption_budget_would_be_violated(name).await? {
            warn!(node = %name, "removal would violate a disruption budget");
            return Ok(DeprovisionOutcome::blocked(BlockReason::DisruptionBudget, Some(name)));
        }

        if let Err(e) = self.scheduler.cordon(name).await {
            self.restore(name).await;
            return Err(e);
        }

        let timeout = self.settings.drain_timeout;
        let blocked = match tokio::time::timeout(timeout, self.scheduler.drain(name, timeout)).await {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(BlockReason::DrainFailed),
            Ok(Err(e)) => {
                warn!(node = %name, error = %e, "drain errored");
                Some(BlockReason::DrainFailed)
            }
            Err(_) => Some(BlockReason::DrainTimedOut),
        };

        if let Some(reason) = blocked {
            warn!(node = %name, reason = reason.as_str(), "abandoning scale-down, restoring node");
            self.restore(name).await;
            return Ok(DeprovisionOutcome::blocked(reason, Some(name)));
        }

        if let Err(e) = self.compute.terminate(std::slice::from_ref(&instance_id)).await {
            self.restore(name).await;
            return Err(e);
        }

        info!(node = %name, instance = %instance_id, "node terminated");
        let mut record = candidate.record;
        record.status = NodeStatus::Terminated;
        Ok(DeprovisionOutcome::Removed(record))
    }

    /// Spot workers carrying a reclaim notice that has not been acted on.
    pub async fn interruption_notices(&self) -> LifecycleResult<Vec<NodeRecord>> {
        let workers = self.compute.list_workers().await?;
        Ok(workers.into_iter().filter(NodeRecord::has_pending_interruption).collect())
    }

    /// Act on every pending spot interruption notice.
    ///
    /// Each noticed node is tagged handled, cordoned and drained, then
    /// terminated if the drain finished. One replacement per node is
    /// planned as if the interrupted nodes were already gone. Only the
    /// initial listing can fail; per-node failures are logged and reported.
    pub async fn handle_interruptions(&self, now: u64) -> LifecycleResult<InterruptionReport> {
        let notices = self.interruption_notices().await?;
        let mut report = InterruptionReport::default();
        if notices.is_empty() {
            return Ok(report);
        }
        let nodes = self.scheduler.list_nodes().await?;

        for mut record in notices {
            let id = record.instance_id.clone();
            // Unmarked nodes would be replaced again next cycle.
            if let Err(e) = self.compute.tag(&id, INTERRUPTION_HANDLED_TAG, TAG_TRUE).await {
                warn!(instance = %id, error = %e, "failed to mark interruption handled, skipping node");
                continue;
            }
            if let Err(e) = self.compute.tag(&id, INTERRUPTION_TIME_TAG, &now.to_string()).await {
                debug!(instance = %id, error = %e, "failed to tag interruption time");
            }
            warn!(instance = %id, zone = %record.availability_zone, "spot interruption notice");

            let drained = match nodes.iter().find(|n| n.instance_id == id) {
                Some(node) => self.evacuate(&node.name).await,
                None => {
                    debug!(instance = %id, "interrupted instance has no scheduler node");
                    true
                }
            };
            if drained {
                match self.compute.terminate(std::slice::from_ref(&id)).await {
                    Ok(()) => record.status = NodeStatus::Terminated,
                    Err(e) => warn!(instance = %id, error = %e, "failed to terminate interrupted node"),
                }
            } else {
                warn!(instance = %id, "interrupted node not drained, leaving it to the platform");
                report.undrained.push(id);
            }
            record.tags.insert(INTERRUPTION_HANDLED_TAG.to_string(), TAG_TRUE.to_string());
            report.interrupted.push(record);
        }

        if report.interrupted.is_empty() {
            return Ok(report);
        }

        let count = report.interrupted.len() as u32;
        let remaining: Vec<NodeRecord> = match self.compute.list_workers().await {
            Ok(workers) => workers
                .into_iter()
                .filter(|w| !report.interrupted.iter().any(|n| n.instance_id == w.instance_id))
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to list workers for replacement placement");
                Vec::new()
            }
        };
        let plan = self.planner.plan(&remaining, count);
        report.replacements = match self.provision_plan(plan, ProvisionReport::new(count)).await {
            Ok(replacements) => replacements,
            Err(e) => {
                warn!(error = %e, "no replacement could be launched");
                let mut failed = ProvisionReport::new(count);
                failed.launch_failures.push(e.to_string());
                failed
            }
        };
        info!(
            interrupted = count,
            replaced = report.replacements.ready_count(),
            "spot interruptions handled"
        );
        Ok(report)
    }

    /// Cordon and drain a node that is going away regardless.
    /// Returns whether the drain finished. The node stays cordoned either way.
    async fn evacuate(&self, name: &str) -> bool {
        if let Err(e) = self.scheduler.cordon(name).await {
            warn!(node = %name, error = %e, "failed to cordon interrupted node");
        }
        let timeout = self.settings.drain_timeout;
        match tokio::time::timeout(timeout, self.scheduler.drain(name, timeout)).await {
            Ok(Ok(drained)) => drained,
            Ok(Err(e)) => {
                warn!(node = %name, error = %e, "drain errored");
                false
            }
            Err(_) => false,
        }
    }

    async fn restore(&self, node: &str) {
        if let Err(e) = self.scheduler.uncordon(node).await {
            warn!(%node, error = %e, "failed to uncordon node");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{DrainBehavior, SimulatedFleet};

    fn manager(fleet: &Arc<SimulatedFleet>) -> NodeLifecycleManager {
        NodeLifecycleManager::new(
            fleet.clone(),
            fleet.clone(),
            PlacementPlanner::new(vec!["zone-a".into(), "zone-b".into()], 0.7),
            LifecycleSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn provision_counts_ready_nodes() {
        let fleet = Arc::new(SimulatedFleet::new());
        fleet.set_ready_after_polls(2);

        let report = manager(&fleet).provision(2).await.unwrap();
        assert_eq!(report.ready_count(), 2);
        assert!(report.join_failed.is_empty());
        assert!(!report.is_partial());
        assert_eq!(fleet.active_count(), 2);

        let zones: Vec<_> = report.ready.iter().map(|n| n.availability_zone.as_str()).collect();
        assert_eq!(zones, vec!["zone-a", "zone-b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn join_failures_are_tagged_and_not_counted() {
        let fleet = Arc::new(SimulatedFleet::new());
        fleet.fail_next_joins(1);

        let report = manager(&fleet).provision(2).await.unwrap();
        assert_eq!(report.ready_count(), 1);
        assert_eq!(report.join_failed.len(), 1);
        assert!(report.is_partial());

        let failed = &report.join_failed[0];
        assert_eq!(failed.status, NodeStatus::JoinFailed);
        assert_eq!(
            fleet.tags(&failed.instance_id).get(STATUS_TAG).map(String::as_str),
            Some(JOIN_FAILED)
        );
        // Left running, not terminated.
        assert!(fleet.terminated().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_rejection_falls_back_to_on_demand() {
        let fleet = Arc::new(SimulatedFleet::new());
        fleet.reject_capacity(LifecycleClass::Spot);

        let report = manager(&fleet).provision(1).await.unwrap();
        assert_eq!(report.ready_count(), 1);
        assert_eq!(report.ready[0].lifecycle_class, LifecycleClass::OnDemand);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_launch_is_retried() {
        let fleet = Arc::new(SimulatedFleet::new());
        fleet.throttle_next_launches(2);

        let report = manager(&fleet).provision(1).await.unwrap();
        assert_eq!(report.ready_count(), 1);
        assert_eq!(fleet.launches().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_throttling_is_an_error() {
        let fleet = Arc::new(SimulatedFleet::new());
        fleet.throttle_next_launches(10);

        let err = manager(&fleet).provision(1).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn deprovision_terminates_after_drain() {
        let fleet = Arc::new(SimulatedFleet::new());
        fleet.seed_node("zone-a", LifecycleClass::OnDemand);
        let spot = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.seed_node("zone-b", LifecycleClass::OnDemand);

        let outcome = manager(&fleet).deprovision().await.unwrap();
        match outcome {
            DeprovisionOutcome::Removed(record) => assert_eq!(record.instance_id, spot),
            other => panic!("expected removal, got {other:?}"),
        }
        assert_eq!(fleet.terminated(), vec![spot]);
        assert_eq!(fleet.active_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_violation_blocks_without_cordon_or_terminate() {
        let fleet = Arc::new(SimulatedFleet::new());
        let id = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.block_budget(&id);

        let outcome = manager(&fleet).deprovision().await.unwrap();
        assert!(matches!(
            outcome,
            DeprovisionOutcome::Blocked {
                reason: BlockReason::DisruptionBudget,
                ..
            }
        ));
        assert!(fleet.terminated().is_empty());
        assert!(!fleet.is_cordoned(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_uncordons_and_keeps_node() {
        let fleet = Arc::new(SimulatedFleet::new());
        let id = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.set_drain_behavior(DrainBehavior::Hang);

        let outcome = manager(&fleet).deprovision().await.unwrap();
        assert!(matches!(
            outcome,
            DeprovisionOutcome::Blocked {
                reason: BlockReason::DrainTimedOut,
                ..
            }
        ));
        assert!(fleet.terminated().is_empty());
        assert!(!fleet.is_cordoned(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_failure_uncordons() {
        let fleet = Arc::new(SimulatedFleet::new());
        let id = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.set_drain_behavior(DrainBehavior::Fail);

        let outcome = manager(&fleet).deprovision().await.unwrap();
        assert!(matches!(
            outcome,
            DeprovisionOutcome::Blocked {
                reason: BlockReason::DrainFailed,
                ..
            }
        ));
        assert!(!fleet.is_cordoned(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn cordon_error_uncordons_before_returning() {
        let fleet = Arc::new(SimulatedFleet::new());
        let id = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.fail_next_cordons(1);

        let err = manager(&fleet).deprovision().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Api(_)));
        assert!(!fleet.is_cordoned(&id));
        assert!(fleet.terminated().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_spot_node_is_drained_and_replaced() {
        let fleet = Arc::new(SimulatedFleet::new());
        let doomed = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.seed_node("zone-b", LifecycleClass::OnDemand);
        fleet.interrupt(&doomed);

        let report = manager(&fleet).handle_interruptions(5_000).await.unwrap();
        assert_eq!(report.interrupted_count(), 1);
        assert_eq!(report.interrupted[0].status, NodeStatus::Terminated);
        assert!(report.undrained.is_empty());
        assert_eq!(report.replacements.ready_count(), 1);
        // Planned as if the interrupted node were gone: zone-a is empty.
        assert_eq!(report.replacements.ready[0].availability_zone, "zone-a");

        let tags = fleet.tags(&doomed);
        assert_eq!(tags.get(INTERRUPTION_HANDLED_TAG).map(String::as_str), Some(TAG_TRUE));
        assert_eq!(tags.get(INTERRUPTION_TIME_TAG).map(String::as_str), Some("5000"));
        assert_eq!(fleet.terminated(), vec![doomed]);
        assert_eq!(fleet.active_count(), 2);

        // Nothing left to handle.
        let again = manager(&fleet).handle_interruptions(5_120).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undrained_interrupted_node_is_left_to_the_platform() {
        let fleet = Arc::new(SimulatedFleet::new());
        let doomed = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.interrupt(&doomed);
        fleet.set_drain_behavior(DrainBehavior::Hang);

        let report = manager(&fleet).handle_interruptions(5_000).await.unwrap();
        assert_eq!(report.undrained, vec![doomed.clone()]);
        assert!(fleet.terminated().is_empty());
        assert!(fleet.is_cordoned(&doomed));
        assert_eq!(report.replacements.ready_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_notices_ignore_on_demand_and_handled_nodes() {
        let fleet = Arc::new(SimulatedFleet::new());
        let on_demand = fleet.seed_node("zone-a", LifecycleClass::OnDemand);
        let handled = fleet.seed_node("zone-a", LifecycleClass::Spot);
        let fresh = fleet.seed_node("zone-b", LifecycleClass::Spot);
        fleet.interrupt(&on_demand);
        fleet.interrupt(&handled);
        fleet.interrupt(&fresh);
        fleet.tag(&handled, INTERRUPTION_HANDLED_TAG, TAG_TRUE).await.unwrap();

        let notices = manager(&fleet).interruption_notices().await.unwrap();
        let ids: Vec<_> = notices.iter().map(|n| n.instance_id.as_str()).collect();
        assert_eq!(ids, vec![fresh.as_str()]);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_nodes_are_never_chosen() {
        let fleet = Arc::new(SimulatedFleet::new());
        let id = fleet.seed_node("zone-a", LifecycleClass::Spot);
        fleet.mark_critical(&id);

        let outcome = manager(&fleet).deprovision().await.unwrap();
        assert_eq!(
            outcome,
            DeprovisionOutcome::Blocked {
                reason: BlockReason::NoCandidate,
                node: None
            }
        );
    }
}
