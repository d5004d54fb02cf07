//! redb table definitions for the NodeFleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// One `ClusterState` per cluster, keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Archived metrics snapshots keyed by `{cluster_id}:{timestamp:020}`.
pub const METRICS_ARCHIVE: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics_archive");

/// Scaling journal keyed by `{cluster_id}:{timestamp:020}:{kind}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
