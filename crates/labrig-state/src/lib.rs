//! labrig-state — embedded state store for the labrig scheduler.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and
//! in-memory state management for jobs, hosts, host queue entries, and
//! special (maintenance) tasks.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value
//! columns, keyed by their `u64` record id. A small `meta` table holds
//! monotonic id counters. Records are retired (moved to a terminal
//! status) but never deleted, so a scheduler restart always sees the
//! full history it needs to reconcile.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and is handed to the dispatcher as an explicit
//! dependency — there is no ambient global store.

pub mod error;
pub mod machine;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
