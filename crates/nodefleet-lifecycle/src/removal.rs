//! Choosing which node to retire.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::types::{LifecycleClass, NodeRecord, SchedulerNode};

/// A node eligible for removal with the facts it was ranked on.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovalCandidate {
    pub node: SchedulerNode,
    pub record: NodeRecord,
    /// Active nodes in the candidate's zone.
    pub zone_nodes: u32,
}

/// Rank nodes for removal, best candidate first.
///
/// Excluded: nodes running critical workloads, nodes already cordoned or
/// not ready, and nodes with no matching worker record. Order: zone with
/// the most nodes, then spot before on-demand, then most idle, then fewest
/// work items, then instance id.
pub fn rank_removal_candidates(nodes: &[SchedulerNode], records: &[NodeRecord]) -> Vec<RemovalCandidate> {
    let by_id: HashMap<&str, &NodeRecord> = records
        .iter()
        .filter(|r| r.status.is_active())
        .map(|r| (r.instance_id.as_str(), r))
        .collect();

    let mut zone_nodes: HashMap<&str, u32> = HashMap::new();
    for record in by_id.values() {
        *zone_nodes.entry(record.availability_zone.as_str()).or_default() += 1;
    }

    let mut candidates: Vec<RemovalCandidate> = nodes
        .iter()
        .filter(|n| n.ready && n.schedulable && !n.has_critical_workloads)
        .filter_map(|n| {
            let record = by_id.get(n.instance_id.as_str())?;
            Some(RemovalCandidate {
                node: n.clone(),
                record: (*record).clone(),
                zone_nodes: zone_nodes
                    .get(record.availability_zone.as_str())
                    .copied()
                    .unwrap_or(0),
            })
        })
        .collect();

    candidates.sort_by(compare_candidates);
    candidates
}

fn compare_candidates(a: &RemovalCandidate, b: &RemovalCandidate) -> Ordering {
    b.zone_nodes
        .cmp(&a.zone_nodes)
        .then_with(|| class_rank(a.record.lifecycle_class).cmp(&class_rank(b.record.lifecycle_class)))
        .then_with(|| b.node.idle_percent.total_cmp(&a.node.idle_percent))
        .then_with(|| a.node.work_items.cmp(&b.node.work_items))
        .then_with(|| a.record.instance_id.cmp(&b.record.instance_id))
}

fn class_rank(class: LifecycleClass) -> u8 {
    match class {
        LifecycleClass::Spot => 0,
        LifecycleClass::OnDemand => 1,
    }
}
