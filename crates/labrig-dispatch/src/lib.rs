//! labrig-dispatch — the lab job scheduler core.
//!
//! The dispatcher assigns queued test jobs to hosts, drives each host
//! through verify/repair/reset maintenance, launches and tracks
//! external test-execution processes through the drone layer, and
//! enforces the global process-capacity ceiling.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher::tick()
//!   ├── DroneManager::refresh()       reconcile process completions
//!   ├── process completions           advance HQE / special-task machines
//!   ├── handle aborts                 kill + drive abort transitions
//!   ├── continuations                 restart gather/parse stages
//!   └── due actions                   verify/reset/job-start, throttled
//!         └── TicketPool              per-tick capacity accounting
//! ```
//!
//! The loop is single-threaded and cooperative: a single synchronous
//! `tick()` invoked repeatedly. Waiting is a state revisited on the
//! next tick, never a blocked call. All collaborators (state store,
//! drone manager, notifier) are explicit dependencies passed to the
//! constructor; there is no ambient global state.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod recovery;
pub mod throttle;

pub use config::DispatcherConfig;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};
pub use notify::{LogNotifier, MemoryNotifier, Notifier};
pub use throttle::TicketPool;
