//! labrig-drone — the process-execution backend seam.
//!
//! A "drone" is a worker capable of executing test processes. The
//! dispatcher never spawns processes itself: it issues commands through
//! the [`DroneManager`] trait and observes their lifecycle through
//! pidfile records, polled once per tick. A pidfile here is the tracked
//! record of one external process (not necessarily a literal pid file
//! on disk), keyed by `(working_directory, pidfile_name)`.
//!
//! # Components
//!
//! - **`pidfile`** — `PidfileId`, `PidfileContents`, `ExitStatus`, the
//!   process handle
//! - **`manager`** — the `DroneManager` contract consumed by the
//!   dispatcher
//! - **`sim`** — `SimDroneManager`, an in-process backend for tests and
//!   dry runs

pub mod error;
pub mod manager;
pub mod pidfile;
pub mod sim;

pub use error::{DroneError, DroneResult};
pub use manager::DroneManager;
pub use pidfile::{ExitStatus, PidfileContents, PidfileId, PidfileName, Process};
pub use sim::SimDroneManager;
