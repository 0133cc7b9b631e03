//! Legal state transitions for hosts and queue entries.
//!
//! The dispatcher only ever moves records along these edges; the store
//! rejects anything else with `StateError::IllegalTransition`. Keeping
//! the rules in one place makes the two state machines auditable
//! without reading the dispatcher.

use crate::types::{EntryStatus, HostStatus};

/// Whether a host may move from `from` to `to`.
///
/// A no-op transition (`from == to`) is always legal; the dispatcher
/// re-asserts statuses when it restarts a stage.
pub fn host_transition_allowed(from: HostStatus, to: HostStatus) -> bool {
    use HostStatus::*;
    if from == to {
        return true;
    }
    match from {
        Ready => matches!(to, Verifying | Resetting | Pending | Cleaning | Repairing),
        Verifying => matches!(to, Pending | Ready | Repairing),
        Resetting => matches!(to, Pending | Ready | Repairing),
        Pending => matches!(to, Running | Ready),
        Running => matches!(to, Gathering | Cleaning | Ready),
        Gathering => matches!(to, Cleaning | Ready | Repairing),
        Cleaning => matches!(to, Ready | Repairing),
        Repairing => matches!(to, Ready | RepairFailed),
        // Terminal until an operator resets the host.
        RepairFailed => matches!(to, Ready),
    }
}

/// Whether a queue entry may move from `from` to `to`.
///
/// `Running -> Starting` is the crash-recovery edge: a restarted
/// dispatcher reverts entries whose job process disappeared so the
/// group is relaunched from the start of the stage.
pub fn entry_transition_allowed(from: EntryStatus, to: EntryStatus) -> bool {
    use EntryStatus::*;
    if from == to {
        return true;
    }
    match from {
        // Queued -> Failed covers an explicit-host entry whose host was
        // parked in RepairFailed while the entry waited for it.
        Queued => matches!(to, Verifying | Resetting | Pending | Aborted | Failed),
        Verifying => matches!(to, Pending | Queued | Failed | Aborted),
        Resetting => matches!(to, Pending | Queued | Failed | Aborted),
        Pending => matches!(to, Starting | Aborted),
        // Starting -> Pending is the disband edge: a synchronous group
        // that lost a sibling before launch returns to the pending pool.
        Starting => matches!(to, Running | Pending | Aborted),
        Running => matches!(to, Gathering | Parsing | Starting | Aborted),
        Gathering => matches!(to, Parsing | Aborted),
        Parsing => matches!(to, Completed | Failed | Aborted),
        Aborted | Completed | Failed => false,
    }
}
