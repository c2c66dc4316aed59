//! redb table definitions for the errand state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Deployment records keyed by deployment name.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Task records keyed by task id.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Resource pool accounting keyed by pool name.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_pools");

/// Instance records keyed by `{deployment}/{job}/{index}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");
