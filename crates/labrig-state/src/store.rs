//! StateStore — redb-backed persistence for the labrig scheduler.
//!
//! Provides typed CRUD operations over jobs, hosts, queue entries, and
//! special tasks, plus the "due work" queries the dispatcher runs each
//! tick. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).
//!
//! Status changes go through `set_host_status` / `set_entry_status`,
//! which enforce the transition rules in [`crate::machine`].

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::machine::{entry_transition_allowed, host_transition_allowed};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(QUEUE_ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(SPECIAL_TASKS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Allocate the next id for the named counter.
    fn next_id(&self, counter: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            let current = table
                .get(counter)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            id = current + 1;
            table.insert(counter, id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(id)
    }

    // ── Generic record plumbing ────────────────────────────────────

    fn write_record<T: Serialize>(
        &self,
        table_def: TableDefinition<'static, u64, &[u8]>,
        id: u64,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .insert(id, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn read_record<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<'static, u64, &[u8]>,
        id: u64,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan_records<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<'static, u64, &[u8]>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Register a host in the lab inventory.
    pub fn add_host(
        &self,
        hostname: &str,
        labels: Vec<String>,
        protection: HostProtection,
    ) -> StateResult<Host> {
        let host = Host {
            id: self.next_id("host")?,
            hostname: hostname.to_string(),
            status: HostStatus::Ready,
            locked: false,
            protection,
            labels,
            dirty: false,
            repair_failures: 0,
            updated_at: epoch_secs(),
        };
        self.write_record(HOSTS, host.id, &host)?;
        debug!(host_id = host.id, hostname, "host added");
        Ok(host)
    }

    pub fn get_host(&self, id: HostId) -> StateResult<Option<Host>> {
        self.read_record(HOSTS, id)
    }

    /// Update a host record in place. Status changes should go through
    /// `set_host_status` instead.
    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.write_record(HOSTS, host.id, host)
    }

    /// Move a host to a new status, enforcing the host state machine.
    pub fn set_host_status(&self, id: HostId, to: HostStatus) -> StateResult<Host> {
        let mut host = self
            .get_host(id)?
            .ok_or_else(|| StateError::NotFound(format!("host {id}")))?;
        if !host_transition_allowed(host.status, to) {
            return Err(StateError::IllegalTransition {
                entity: "host",
                from: host.status.to_string(),
                to: to.to_string(),
            });
        }
        host.status = to;
        host.updated_at = epoch_secs();
        self.put_host(&host)?;
        Ok(host)
    }

    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        self.scan_records(HOSTS)
    }

    /// Find a schedulable host carrying the given label, skipping any
    /// host in `exclude`. Used to resolve metahost entries.
    pub fn ready_host_with_label(
        &self,
        label: &str,
        exclude: &[HostId],
    ) -> StateResult<Option<Host>> {
        let hosts = self.list_hosts()?;
        Ok(hosts.into_iter().find(|h| {
            h.status.is_available()
                && !h.locked
                && h.has_label(label)
                && !exclude.contains(&h.id)
        }))
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Create a job and its queue entries.
    ///
    /// Configuration errors (under-provisioned synchronous jobs,
    /// duplicate hosts, unknown labels) are rejected here, before any
    /// entry exists; they never surface mid-execution.
    pub fn create_job(&self, spec: JobSpec) -> StateResult<(Job, Vec<HostQueueEntry>)> {
        self.validate_job_spec(&spec)?;

        let job = Job {
            id: self.next_id("job")?,
            name: spec.name,
            priority: spec.priority,
            synch_count: spec.synch_count,
            reboot_before: spec.reboot_before,
            reboot_after: spec.reboot_after,
            run_verify: spec.run_verify,
            run_reset: spec.run_reset,
            dependencies: spec.dependencies,
            parent_job_id: spec.parent_job_id,
            is_template: spec.is_template,
            aborted: false,
            keyvals: spec.keyvals,
            created_at: epoch_secs(),
        };
        self.write_record(JOBS, job.id, &job)?;

        let mut entries = Vec::new();
        for host_id in &spec.hosts {
            entries.push(self.create_entry(job.id, Some(*host_id), None)?);
        }
        for label in &spec.meta_hosts {
            entries.push(self.create_entry(job.id, None, Some(label.clone()))?);
        }
        debug!(job_id = job.id, entries = entries.len(), "job created");
        Ok((job, entries))
    }

    fn validate_job_spec(&self, spec: &JobSpec) -> StateResult<()> {
        if spec.synch_count == 0 {
            return Err(StateError::InvalidJob("synch_count must be >= 1".into()));
        }
        let requested = spec.hosts.len() + spec.meta_hosts.len();
        if requested == 0 {
            return Err(StateError::InvalidJob("no hosts requested".into()));
        }
        if spec.synch_count as usize > requested {
            return Err(StateError::InvalidJob(format!(
                "synchronous job under-provisioned: synch_count {} > {} requested hosts",
                spec.synch_count, requested
            )));
        }
        let mut seen = Vec::new();
        for host_id in &spec.hosts {
            if seen.contains(host_id) {
                return Err(StateError::InvalidJob(format!(
                    "duplicate host {host_id}"
                )));
            }
            seen.push(*host_id);
            if self.get_host(*host_id)?.is_none() {
                return Err(StateError::InvalidJob(format!("unknown host {host_id}")));
            }
        }
        let hosts = self.list_hosts()?;
        for label in spec.dependencies.iter().chain(spec.meta_hosts.iter()) {
            if !hosts.iter().any(|h| h.has_label(label)) {
                return Err(StateError::InvalidJob(format!(
                    "no host carries label {label:?}"
                )));
            }
        }
        Ok(())
    }

    fn create_entry(
        &self,
        job_id: JobId,
        host_id: Option<HostId>,
        meta_host: Option<String>,
    ) -> StateResult<HostQueueEntry> {
        let entry = HostQueueEntry {
            id: self.next_id("entry")?,
            job_id,
            host_id,
            meta_host,
            status: EntryStatus::Queued,
            aborted: false,
            execution_subdir: None,
            started_on: None,
            requeue_count: 0,
        };
        self.write_record(QUEUE_ENTRIES, entry.id, &entry)?;
        Ok(entry)
    }

    pub fn get_job(&self, id: JobId) -> StateResult<Option<Job>> {
        self.read_record(JOBS, id)
    }

    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        self.write_record(JOBS, job.id, job)
    }

    /// Request an abort of a whole job: flags the job and every
    /// non-terminal entry. The dispatcher observes the flags on its
    /// next tick.
    pub fn abort_job(&self, job_id: JobId) -> StateResult<()> {
        let mut job = self
            .get_job(job_id)?
            .ok_or_else(|| StateError::NotFound(format!("job {job_id}")))?;
        job.aborted = true;
        self.put_job(&job)?;
        for mut entry in self.entries_for_job(job_id)? {
            if !entry.status.is_terminal() {
                entry.aborted = true;
                self.put_entry(&entry)?;
            }
        }
        debug!(job_id, "job abort requested");
        Ok(())
    }

    // ── Queue entries ──────────────────────────────────────────────

    pub fn get_entry(&self, id: EntryId) -> StateResult<Option<HostQueueEntry>> {
        self.read_record(QUEUE_ENTRIES, id)
    }

    pub fn put_entry(&self, entry: &HostQueueEntry) -> StateResult<()> {
        self.write_record(QUEUE_ENTRIES, entry.id, entry)
    }

    /// Move an entry to a new status, enforcing the entry state machine.
    pub fn set_entry_status(
        &self,
        id: EntryId,
        to: EntryStatus,
    ) -> StateResult<HostQueueEntry> {
        let mut entry = self
            .get_entry(id)?
            .ok_or_else(|| StateError::NotFound(format!("entry {id}")))?;
        if !entry_transition_allowed(entry.status, to) {
            return Err(StateError::IllegalTransition {
                entity: "entry",
                from: entry.status.to_string(),
                to: to.to_string(),
            });
        }
        entry.status = to;
        self.put_entry(&entry)?;
        Ok(entry)
    }

    pub fn entries_for_job(&self, job_id: JobId) -> StateResult<Vec<HostQueueEntry>> {
        let mut entries: Vec<HostQueueEntry> = self.scan_records(QUEUE_ENTRIES)?;
        entries.retain(|e| e.job_id == job_id);
        Ok(entries)
    }

    /// Request an abort of a single entry.
    pub fn abort_entry(&self, entry_id: EntryId) -> StateResult<()> {
        let mut entry = self
            .get_entry(entry_id)?
            .ok_or_else(|| StateError::NotFound(format!("entry {entry_id}")))?;
        if !entry.status.is_terminal() {
            entry.aborted = true;
            self.put_entry(&entry)?;
        }
        Ok(())
    }

    /// All entries not yet in a terminal state, the dispatcher's
    /// working set each tick.
    pub fn unfinished_entries(&self) -> StateResult<Vec<HostQueueEntry>> {
        let mut entries: Vec<HostQueueEntry> = self.scan_records(QUEUE_ENTRIES)?;
        entries.retain(|e| !e.status.is_terminal());
        Ok(entries)
    }

    // ── Special tasks ──────────────────────────────────────────────

    /// Queue a maintenance task against a host.
    pub fn create_task(
        &self,
        host_id: HostId,
        kind: TaskKind,
        queue_entry_id: Option<EntryId>,
        requested_by: &str,
    ) -> StateResult<SpecialTask> {
        let task = SpecialTask {
            id: self.next_id("task")?,
            host_id,
            task: kind,
            queue_entry_id,
            requested_by: requested_by.to_string(),
            is_active: false,
            is_complete: false,
            success: false,
            time_requested: epoch_secs(),
            time_started: None,
        };
        self.write_record(SPECIAL_TASKS, task.id, &task)?;
        debug!(task_id = task.id, host_id, kind = %kind, "special task queued");
        Ok(task)
    }

    /// External request path: queue a manual maintenance task (e.g., a
    /// reverify) against a host.
    pub fn request_special_task(
        &self,
        host_id: HostId,
        kind: TaskKind,
        requested_by: &str,
    ) -> StateResult<SpecialTask> {
        self.create_task(host_id, kind, None, requested_by)
    }

    /// External request path: manual reverify of a host.
    pub fn request_reverify(&self, host_id: HostId, requested_by: &str) -> StateResult<SpecialTask> {
        self.request_special_task(host_id, TaskKind::Verify, requested_by)
    }

    pub fn get_task(&self, id: TaskId) -> StateResult<Option<SpecialTask>> {
        self.read_record(SPECIAL_TASKS, id)
    }

    pub fn put_task(&self, task: &SpecialTask) -> StateResult<()> {
        self.write_record(SPECIAL_TASKS, task.id, task)
    }

    /// Tasks waiting to start.
    pub fn queued_tasks(&self) -> StateResult<Vec<SpecialTask>> {
        let mut tasks: Vec<SpecialTask> = self.scan_records(SPECIAL_TASKS)?;
        tasks.retain(|t| t.is_queued());
        Ok(tasks)
    }

    /// Tasks whose process is running.
    pub fn active_tasks(&self) -> StateResult<Vec<SpecialTask>> {
        let mut tasks: Vec<SpecialTask> = self.scan_records(SPECIAL_TASKS)?;
        tasks.retain(|t| t.is_active && !t.is_complete);
        Ok(tasks)
    }

    /// The incomplete task attached to an entry, if any.
    pub fn unfinished_task_for_entry(
        &self,
        entry_id: EntryId,
    ) -> StateResult<Option<SpecialTask>> {
        let tasks: Vec<SpecialTask> = self.scan_records(SPECIAL_TASKS)?;
        Ok(tasks
            .into_iter()
            .find(|t| !t.is_complete && t.queue_entry_id == Some(entry_id)))
    }

    /// Whether the host already has an incomplete active task. A host
    /// runs at most one process at a time.
    pub fn host_has_active_task(&self, host_id: HostId) -> StateResult<bool> {
        let tasks: Vec<SpecialTask> = self.scan_records(SPECIAL_TASKS)?;
        Ok(tasks
            .iter()
            .any(|t| t.host_id == host_id && t.is_active && !t.is_complete))
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
