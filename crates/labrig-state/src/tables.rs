//! redb table definitions for the labrig state store.
//!
//! Record tables use `u64` ids as keys and JSON-serialized domain types
//! as `&[u8]` values. The `meta` table holds monotonic id counters,
//! keyed by counter name.

use redb::TableDefinition;

/// Job records keyed by job id.
pub const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");

/// Host records keyed by host id.
pub const HOSTS: TableDefinition<u64, &[u8]> = TableDefinition::new("hosts");

/// Host queue entries keyed by entry id.
pub const QUEUE_ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("queue_entries");

/// Special (maintenance) tasks keyed by task id.
pub const SPECIAL_TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("special_tasks");

/// Id counters keyed by counter name (`"job"`, `"host"`, ...).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
