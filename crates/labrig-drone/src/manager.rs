//! The `DroneManager` contract consumed by the dispatcher.

use crate::error::DroneResult;
use crate::pidfile::{PidfileContents, PidfileId, PidfileName, Process};

/// Abstraction over distributed execution resources.
///
/// Implementations may run processes in parallel on distributed
/// workers, but expose only a polling interface: no method blocks on
/// an external process. The dispatcher is the only caller and treats
/// the capacity counter as a per-tick ticket pool.
pub trait DroneManager: Send + Sync {
    /// Start work in `working_directory`, tracked under
    /// `(working_directory, pidfile_name)`. Never blocks; completion is
    /// observed later through `get_pidfile_contents`.
    ///
    /// `paired_with` links a follow-on process (e.g., parsing) to the
    /// pidfile of the process whose output it consumes.
    fn execute_command(
        &self,
        command: Vec<String>,
        working_directory: &str,
        pidfile_name: PidfileName,
        num_processes: u32,
        paired_with: Option<&PidfileId>,
    ) -> DroneResult<PidfileId>;

    /// Poll the current contents of a pidfile record. Unknown pidfiles
    /// yield empty contents.
    fn get_pidfile_contents(&self, id: &PidfileId) -> PidfileContents;

    /// Send a signal to a process. Idempotent: signalling a process
    /// that already exited is a no-op.
    fn kill_process(&self, process: &Process, signal: i32);

    /// Start tracking a pidfile the caller expects to exist (used after
    /// a dispatcher restart to re-adopt persisted work).
    fn register_pidfile(&self, id: &PidfileId);

    /// Stop tracking a pidfile. The record is dropped on the following
    /// `refresh()` and must not reappear.
    fn unregister_pidfile(&self, id: &PidfileId);

    /// Number of processes currently running across all drones.
    fn total_running_processes(&self) -> u32;

    /// Spare process capacity: `capacity - total_running_processes()`.
    fn max_runnable_processes(&self) -> u32;

    /// Reconcile backend state. Called once per tick before any
    /// scheduling decision; applies queued unregistrations.
    fn refresh(&self);
}
