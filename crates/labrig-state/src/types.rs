//! Domain types for the labrig scheduler state store.
//!
//! These types represent the persisted state of test jobs, lab hosts,
//! host queue entries (the assignment of one job to one host), and
//! special maintenance tasks. All types are serializable to/from JSON
//! for storage in redb tables.
//!
//! Cross-references between records are plain `u64` ids resolved
//! through the `StateStore`, never embedded object references.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier for a job.
pub type JobId = u64;

/// Unique identifier for a host.
pub type HostId = u64;

/// Unique identifier for a host queue entry.
pub type EntryId = u64;

/// Unique identifier for a special task.
pub type TaskId = u64;

// ── Job ───────────────────────────────────────────────────────────

/// Reboot policy applied before or after a job runs on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootPolicy {
    Never,
    IfDirty,
    Always,
}

/// A requested test run. Immutable once queued except for the
/// operator-level `aborted` flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Scheduling priority (higher runs first).
    pub priority: i32,
    /// Number of hosts that must run this job concurrently.
    pub synch_count: u32,
    pub reboot_before: RebootPolicy,
    pub reboot_after: RebootPolicy,
    /// Whether hosts are verified before the job runs.
    pub run_verify: bool,
    /// Whether hosts are reset before the job runs.
    pub run_reset: bool,
    /// Labels every assigned host must carry.
    pub dependencies: Vec<String>,
    /// Suite linkage: the parent (suite) job, if any.
    pub parent_job_id: Option<JobId>,
    pub is_template: bool,
    /// Operator abort request; observed by the dispatcher on the next tick.
    pub aborted: bool,
    /// Arbitrary key/value metadata recorded with the job.
    pub keyvals: HashMap<String, String>,
    /// Unix timestamp (seconds) when this job was queued.
    pub created_at: u64,
}

/// Parameters for creating a job. Validated before any queue entry
/// exists; an invalid spec never surfaces mid-execution.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub priority: i32,
    pub synch_count: u32,
    pub reboot_before: RebootPolicy,
    pub reboot_after: RebootPolicy,
    pub run_verify: bool,
    pub run_reset: bool,
    pub dependencies: Vec<String>,
    pub parent_job_id: Option<JobId>,
    pub is_template: bool,
    pub keyvals: HashMap<String, String>,
    /// Explicitly requested hosts.
    pub hosts: Vec<HostId>,
    /// Metahost requests: each entry is a label resolved to a concrete
    /// host at assignment time.
    pub meta_hosts: Vec<String>,
}

impl JobSpec {
    /// A minimal asynchronous job spec against the given hosts.
    pub fn simple(name: &str, hosts: Vec<HostId>) -> Self {
        Self {
            name: name.to_string(),
            priority: 0,
            synch_count: 1,
            reboot_before: RebootPolicy::IfDirty,
            reboot_after: RebootPolicy::Never,
            run_verify: false,
            run_reset: false,
            dependencies: Vec::new(),
            parent_job_id: None,
            is_template: false,
            keyvals: HashMap::new(),
            hosts,
            meta_hosts: Vec::new(),
        }
    }
}

// ── Host ──────────────────────────────────────────────────────────

/// Lifecycle status of a lab host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Ready,
    Verifying,
    Resetting,
    Pending,
    Running,
    Gathering,
    Cleaning,
    Repairing,
    RepairFailed,
}

impl HostStatus {
    /// Whether the host can accept new work.
    pub fn is_available(&self) -> bool {
        matches!(self, HostStatus::Ready)
    }

    /// Terminal failure state requiring external intervention.
    pub fn is_failed(&self) -> bool {
        matches!(self, HostStatus::RepairFailed)
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostStatus::Ready => "ready",
            HostStatus::Verifying => "verifying",
            HostStatus::Resetting => "resetting",
            HostStatus::Pending => "pending",
            HostStatus::Running => "running",
            HostStatus::Gathering => "gathering",
            HostStatus::Cleaning => "cleaning",
            HostStatus::Repairing => "repairing",
            HostStatus::RepairFailed => "repair_failed",
        };
        f.write_str(s)
    }
}

/// Protection policy for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostProtection {
    /// Normal maintenance: verify/cleanup failures escalate to repair.
    #[default]
    NoProtection,
    /// Verify is skipped entirely; verify/cleanup failures are benign.
    DoNotVerify,
}

/// Record of a test machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub hostname: String,
    pub status: HostStatus,
    /// A locked host is excluded from scheduling.
    pub locked: bool,
    pub protection: HostProtection,
    pub labels: Vec<String>,
    /// Set when a job runs on the host; cleared by cleanup/reset.
    pub dirty: bool,
    /// Consecutive repair failures; past the configured limit the host
    /// is parked in `RepairFailed`.
    pub repair_failures: u32,
    /// Unix timestamp of the last status change.
    pub updated_at: u64,
}

impl Host {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

// ── Host queue entry ──────────────────────────────────────────────

/// Execution status of a host queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Queued,
    Verifying,
    Resetting,
    Pending,
    Starting,
    Running,
    Gathering,
    Parsing,
    Aborted,
    Completed,
    Failed,
}

impl EntryStatus {
    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryStatus::Aborted | EntryStatus::Completed | EntryStatus::Failed
        )
    }

}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryStatus::Queued => "queued",
            EntryStatus::Verifying => "verifying",
            EntryStatus::Resetting => "resetting",
            EntryStatus::Pending => "pending",
            EntryStatus::Starting => "starting",
            EntryStatus::Running => "running",
            EntryStatus::Gathering => "gathering",
            EntryStatus::Parsing => "parsing",
            EntryStatus::Aborted => "aborted",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The assignment of one job to one host (or metahost label).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostQueueEntry {
    pub id: EntryId,
    pub job_id: JobId,
    /// Resolved at assignment time for metahost entries.
    pub host_id: Option<HostId>,
    /// Label-based scheduling request, resolved to a concrete host when
    /// the entry leaves `Queued`.
    pub meta_host: Option<String>,
    pub status: EntryStatus,
    /// Abort request; observed by the dispatcher on the next tick.
    pub aborted: bool,
    /// Assigned once a host is chosen; keys working directories for the
    /// entry's processes.
    pub execution_subdir: Option<String>,
    /// Unix timestamp when the job process started.
    pub started_on: Option<u64>,
    /// Times this entry was sent back to `Queued` after a verify or
    /// reset failure.
    pub requeue_count: u32,
}

// ── Special task ──────────────────────────────────────────────────

/// Kind of maintenance action run against a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Verify,
    Repair,
    Cleanup,
    Reset,
    Provision,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Verify => "verify",
            TaskKind::Repair => "repair",
            TaskKind::Cleanup => "cleanup",
            TaskKind::Reset => "reset",
            TaskKind::Provision => "provision",
        }
    }

    /// The host status a running task of this kind implies.
    pub fn host_status(&self) -> HostStatus {
        match self {
            TaskKind::Verify => HostStatus::Verifying,
            TaskKind::Repair => HostStatus::Repairing,
            TaskKind::Cleanup => HostStatus::Cleaning,
            TaskKind::Reset | TaskKind::Provision => HostStatus::Resetting,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A maintenance action against a host, optionally tied to the queue
/// entry that triggered it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialTask {
    pub id: TaskId,
    pub host_id: HostId,
    pub task: TaskKind,
    pub queue_entry_id: Option<EntryId>,
    /// Who requested the task: the dispatcher or an external actor.
    pub requested_by: String,
    /// True while the task's process is running.
    pub is_active: bool,
    pub is_complete: bool,
    pub success: bool,
    pub time_requested: u64,
    pub time_started: Option<u64>,
}

impl SpecialTask {
    /// A task that has neither started nor finished.
    pub fn is_queued(&self) -> bool {
        !self.is_active && !self.is_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_terminal_states() {
        assert!(EntryStatus::Completed.is_terminal());
        assert!(EntryStatus::Failed.is_terminal());
        assert!(EntryStatus::Aborted.is_terminal());
        assert!(!EntryStatus::Queued.is_terminal());
        assert!(!EntryStatus::Running.is_terminal());
    }

    #[test]
    fn host_availability() {
        assert!(HostStatus::Ready.is_available());
        assert!(!HostStatus::Repairing.is_available());
        assert!(HostStatus::RepairFailed.is_failed());
    }

    #[test]
    fn task_kind_implies_host_status() {
        assert_eq!(TaskKind::Verify.host_status(), HostStatus::Verifying);
        assert_eq!(TaskKind::Repair.host_status(), HostStatus::Repairing);
        assert_eq!(TaskKind::Cleanup.host_status(), HostStatus::Cleaning);
        assert_eq!(TaskKind::Reset.host_status(), HostStatus::Resetting);
    }

    #[test]
    fn statuses_roundtrip_through_json() {
        let status: EntryStatus = serde_json::from_str("\"gathering\"").unwrap();
        assert_eq!(status, EntryStatus::Gathering);
        assert_eq!(
            serde_json::to_string(&HostStatus::RepairFailed).unwrap(),
            "\"repair_failed\""
        );
    }
}
