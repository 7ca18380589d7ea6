//! redb table definitions for the Drover state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Instance keys follow the pattern `{app_id}:{instance_id}` so the
//! instances of one application sit in a contiguous key range.

use redb::TableDefinition;

/// Application records keyed by `{app_id}`.
pub const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// Instance records keyed by `{app_id}:{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Task records keyed by `{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Executor registrations keyed by `{executor_id}`.
pub const EXECUTORS: TableDefinition<&str, &[u8]> = TableDefinition::new("executors");
