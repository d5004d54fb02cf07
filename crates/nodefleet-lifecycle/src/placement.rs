//! Zone and lifecycle-class selection for new nodes.
//!
//! Each new node goes to the zone with the fewest active nodes (ties broken
//! by configured zone order) and is spot while spot nodes stay under the
//! target share of the fleet.

use std::collections::BTreeMap;

use nodefleet_core::config::PlacementConfig;

use crate::types::{LifecycleClass, NodeRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub zone: String,
    pub class: LifecycleClass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacementPlanner {
    zones: Vec<String>,
    spot_ratio: f64,
}

impl PlacementPlanner {
    pub fn new(zones: Vec<String>, spot_ratio: f64) -> Self {
        Self {
            zones,
            spot_ratio: spot_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &PlacementConfig) -> Self {
        Self::new(config.zones.clone(), config.spot_ratio)
    }

    /// Plan `count` placements given the nodes already running.
    ///
    /// Nodes in zones outside the configured list still count toward the
    /// class mix but never attract new placements.
    pub fn plan(&self, existing: &[NodeRecord], count: u32) -> Vec<Placement> {
        if self.zones.is_empty() {
            return Vec::new();
        }

        let mut per_zone: BTreeMap<&str, u32> = self.zones.iter().map(|z| (z.as_str(), 0)).collect();
        let mut total = 0u32;
        let mut spot = 0u32;

        for node in existing.iter().filter(|n| n.status.is_active()) {
            if let Some(n) = per_zone.get_mut(node.availability_zone.as_str()) {
                *n += 1;
            }
            total += 1;
            if node.lifecycle_class == LifecycleClass::Spot {
                spot += 1;
            }
        }

        let mut plan = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let zone = self.least_loaded_zone(&per_zone);
            let class = self.next_class(spot, total);

            if let Some(n) = per_zone.get_mut(zone) {
                *n += 1;
            }
            total += 1;
            if class == LifecycleClass::Spot {
                spot += 1;
            }

            plan.push(Placement {
                zone: zone.to_string(),
                class,
            });
        }
        plan
    }

    /// Spot while the fleet including the new node stays within the ratio.
    pub fn next_class(&self, spot: u32, total: u32) -> LifecycleClass {
        if (spot as f64) < self.spot_ratio * (total + 1) as f64 {
            LifecycleClass::Spot
        } else {
            LifecycleClass::OnDemand
        }
    }

    fn least_loaded_zone<'a>(&'a self, per_zone: &BTreeMap<&str, u32>) -> &'a str {
        let mut best = self.zones[0].as_str();
        let mut best_count = u32::MAX;
        for zone in &self.zones {
            let n = per_zone.get(zone.as_str()).copied().unwrap_or(0);
            if n < best_count {
                best = zone.as_str();
                best_count = n;
            }
        }
        best
    }
}
