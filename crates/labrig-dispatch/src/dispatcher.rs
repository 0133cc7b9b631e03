//! The dispatcher tick loop.
//!
//! A single synchronous [`Dispatcher::tick`] invoked repeatedly. Each
//! tick, in order: reconcile drone state, advance the state machines of
//! everything whose process ended, honor abort requests, then admit as
//! many due actions as fit under the capacity ceiling. Anything that
//! does not fit is deferred to a later tick.
//!
//! The dispatcher owns a map from pidfile id to the record(s) that the
//! process drives forward. The map is in-memory only; after a restart
//! it is rebuilt from persisted state by [`Dispatcher::recover`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use labrig_drone::{DroneManager, ExitStatus, PidfileContents, PidfileId, PidfileName};
use labrig_state::machine::host_transition_allowed;
use labrig_state::store::epoch_secs;
use labrig_state::{
    EntryId, EntryStatus, Host, HostId, HostProtection, HostQueueEntry, HostStatus, Job, JobId,
    RebootPolicy, SpecialTask, StateStore, TaskId, TaskKind,
};

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::notify::Notifier;
use crate::throttle::TicketPool;

/// Signal sent to processes on abort.
const KILL_SIGNAL: i32 = 15;

/// What a tracked pidfile drives forward when its process ends. A job
/// process for a synchronous group is shared by every sibling entry.
#[derive(Debug, Clone)]
pub(crate) enum PidfileOwner {
    Entries(Vec<EntryId>),
    Task(TaskId),
}

/// The scheduler control loop. All collaborators are explicit
/// dependencies; construct once and call [`tick`](Self::tick) from a
/// driver loop.
pub struct Dispatcher {
    pub(crate) store: StateStore,
    pub(crate) drones: Arc<dyn DroneManager>,
    notifier: Arc<dyn Notifier>,
    config: DispatcherConfig,
    pub(crate) owners: HashMap<PidfileId, PidfileOwner>,
}

impl Dispatcher {
    pub fn new(
        store: StateStore,
        drones: Arc<dyn DroneManager>,
        notifier: Arc<dyn Notifier>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            drones,
            notifier,
            config,
            owners: HashMap::new(),
        }
    }

    /// Run one scheduling pass. Abort checks run before new-action
    /// admission, so an abort always pre-empts a not-yet-started action
    /// in the same tick.
    pub fn tick(&mut self) -> DispatchResult<()> {
        self.drones.refresh();
        self.process_completions()?;
        self.handle_aborts()?;

        // Capacity is read once per tick and spent as a ticket pool.
        // Continuations of already-running work go first so new job
        // starts cannot starve them.
        let mut tickets = TicketPool::new(self.drones.max_runnable_processes());
        self.start_continuations(&mut tickets)?;
        self.schedule_entry_intake()?;
        self.start_special_tasks(&mut tickets)?;
        self.promote_pending_groups()?;
        self.start_job_groups(&mut tickets)?;
        Ok(())
    }

    // ── Process completions ────────────────────────────────────────

    /// Advance the owner of every pidfile whose process has ended, then
    /// drop the record. Kills and normal exits flow through this same
    /// path; the cause is only visible in the exit status.
    fn process_completions(&mut self) -> DispatchResult<()> {
        let finished: Vec<(PidfileId, PidfileOwner)> = self
            .owners
            .iter()
            .filter(|(id, _)| self.drones.get_pidfile_contents(id).has_ended())
            .map(|(id, owner)| (id.clone(), owner.clone()))
            .collect();

        for (id, owner) in finished {
            let contents = self.drones.get_pidfile_contents(&id);
            debug!(pidfile = %id, "process ended");
            match owner {
                PidfileOwner::Task(task_id) => self.on_task_complete(task_id, &contents)?,
                PidfileOwner::Entries(entry_ids) => match id.name {
                    PidfileName::Job => self.on_job_process_complete(&entry_ids, &contents)?,
                    PidfileName::CrashInfo => self.on_gather_complete(&entry_ids)?,
                    PidfileName::Parse => self.on_parse_complete(&entry_ids, &contents)?,
                    PidfileName::Task => {
                        return Err(DispatchError::Inconsistent(format!(
                            "task pidfile {id} owned by queue entries"
                        )));
                    }
                },
            }
            self.drones.unregister_pidfile(&id);
            self.owners.remove(&id);
        }
        Ok(())
    }

    fn on_job_process_complete(
        &mut self,
        entry_ids: &[EntryId],
        contents: &PidfileContents,
    ) -> DispatchResult<()> {
        let gather = self.needs_gather(contents);
        for &id in entry_ids {
            let entry = self.require_entry(id)?;
            if entry.status != EntryStatus::Running {
                continue;
            }
            if entry.aborted {
                // A killed job still gets post-job cleanup, but never
                // crash-info collection or parsing.
                self.store.set_entry_status(id, EntryStatus::Aborted)?;
                if let Some(host_id) = entry.host_id {
                    self.release_host_after_job(host_id, entry.job_id)?;
                }
                info!(entry = id, "job process aborted");
            } else if gather {
                self.store.set_entry_status(id, EntryStatus::Gathering)?;
                if let Some(host_id) = entry.host_id {
                    self.store.set_host_status(host_id, HostStatus::Gathering)?;
                }
            } else {
                self.store.set_entry_status(id, EntryStatus::Parsing)?;
                if let Some(host_id) = entry.host_id {
                    self.release_host_after_job(host_id, entry.job_id)?;
                }
            }
        }
        Ok(())
    }

    fn on_gather_complete(&mut self, entry_ids: &[EntryId]) -> DispatchResult<()> {
        for &id in entry_ids {
            let entry = self.require_entry(id)?;
            if entry.status != EntryStatus::Gathering {
                continue;
            }
            let next = if entry.aborted {
                EntryStatus::Aborted
            } else {
                EntryStatus::Parsing
            };
            self.store.set_entry_status(id, next)?;
            if let Some(host_id) = entry.host_id {
                self.release_host_after_job(host_id, entry.job_id)?;
            }
        }
        Ok(())
    }

    fn on_parse_complete(
        &mut self,
        entry_ids: &[EntryId],
        contents: &PidfileContents,
    ) -> DispatchResult<()> {
        let exit_clean = contents
            .exit_status
            .map(|e| e.is_success())
            .unwrap_or(false);
        let tests_failed = contents.num_tests_failed.unwrap_or(0);
        let clean = exit_clean && tests_failed == 0;

        for &id in entry_ids {
            let entry = self.require_entry(id)?;
            if entry.status != EntryStatus::Parsing {
                continue;
            }
            let next = if entry.aborted {
                EntryStatus::Aborted
            } else if clean {
                EntryStatus::Completed
            } else {
                EntryStatus::Failed
            };
            self.store.set_entry_status(id, next)?;
            info!(entry = id, tests_failed, status = %next, "entry finished");
        }
        Ok(())
    }

    fn on_task_complete(
        &mut self,
        task_id: TaskId,
        contents: &PidfileContents,
    ) -> DispatchResult<()> {
        let mut task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| DispatchError::Inconsistent(format!("task {task_id} missing")))?;
        let success = contents
            .exit_status
            .map(|e| e.is_success())
            .unwrap_or(false);
        task.is_active = false;
        task.is_complete = true;
        task.success = success;
        self.store.put_task(&task)?;

        let host = self.require_host(task.host_id)?;
        let entry = match task.queue_entry_id {
            Some(id) => self.store.get_entry(id)?,
            None => None,
        };

        // An abort observed mid-maintenance resolves the entry and
        // frees the host without repair escalation.
        if let Some(entry) = &entry {
            if entry.aborted && !entry.status.is_terminal() {
                self.store.set_entry_status(entry.id, EntryStatus::Aborted)?;
                self.store.set_host_status(host.id, HostStatus::Ready)?;
                info!(entry = entry.id, host = host.id, "maintenance aborted");
                return Ok(());
            }
        }

        match task.task {
            TaskKind::Verify | TaskKind::Reset | TaskKind::Provision => {
                if success || host.protection == HostProtection::DoNotVerify {
                    if success {
                        let mut host = host.clone();
                        host.repair_failures = 0;
                        if task.task != TaskKind::Verify {
                            host.dirty = false;
                        }
                        self.store.put_host(&host)?;
                    }
                    if let Some(entry) = entry {
                        self.store.set_host_status(host.id, HostStatus::Pending)?;
                        self.store.set_entry_status(entry.id, EntryStatus::Pending)?;
                    } else {
                        self.store.set_host_status(host.id, HostStatus::Ready)?;
                    }
                } else {
                    warn!(host = host.id, kind = %task.task, "maintenance failed, scheduling repair");
                    if let Some(entry) = entry {
                        self.requeue_after_failure(entry)?;
                    }
                    self.store
                        .create_task(host.id, TaskKind::Repair, None, "dispatcher")?;
                }
            }
            TaskKind::Cleanup => {
                if success {
                    let mut host = host.clone();
                    host.dirty = false;
                    self.store.put_host(&host)?;
                    self.store.set_host_status(host.id, HostStatus::Ready)?;
                } else if host.protection == HostProtection::DoNotVerify {
                    self.store.set_host_status(host.id, HostStatus::Ready)?;
                } else {
                    warn!(host = host.id, "cleanup failed, scheduling repair");
                    self.store
                        .create_task(host.id, TaskKind::Repair, None, "dispatcher")?;
                }
            }
            TaskKind::Repair => {
                if success {
                    let mut host = self.store.set_host_status(host.id, HostStatus::Ready)?;
                    host.repair_failures = 0;
                    self.store.put_host(&host)?;
                    info!(host = host.id, "host repaired");
                } else {
                    let mut host = host.clone();
                    host.repair_failures += 1;
                    self.store.put_host(&host)?;
                    if host.repair_failures > self.config.max_repair_limit {
                        self.store
                            .set_host_status(host.id, HostStatus::RepairFailed)?;
                        error!(
                            host = host.id,
                            failures = host.repair_failures,
                            "host exceeded repair limit"
                        );
                        self.notifier.notify(
                            "host repair failed",
                            &format!(
                                "host {} ({}) parked after {} failed repair attempts",
                                host.id, host.hostname, host.repair_failures
                            ),
                        );
                    } else {
                        self.store
                            .create_task(host.id, TaskKind::Repair, None, "dispatcher")?;
                    }
                }
            }
        }
        Ok(())
    }

    // ── Aborts ─────────────────────────────────────────────────────

    /// Kill the active process of every entry flagged aborted; entries
    /// with nothing running are resolved immediately. Killed processes
    /// finish through the normal completion path on a later tick.
    fn handle_aborts(&mut self) -> DispatchResult<()> {
        for entry in self.store.unfinished_entries()? {
            if !entry.aborted {
                continue;
            }
            if let Some(pidfile) = self.active_pidfile_for_entry(&entry) {
                let contents = self.drones.get_pidfile_contents(&pidfile);
                if let Some(process) = &contents.process {
                    if !contents.has_ended() {
                        info!(entry = entry.id, pidfile = %pidfile, "killing aborted process");
                        self.drones.kill_process(process, KILL_SIGNAL);
                    }
                }
                continue;
            }
            if let Some(mut task) = self.store.unfinished_task_for_entry(entry.id)? {
                if task.is_active {
                    let host = self.require_host(task.host_id)?;
                    let pidfile = PidfileId::new(&task_tag(&host, &task), PidfileName::Task);
                    let contents = self.drones.get_pidfile_contents(&pidfile);
                    if let Some(process) = &contents.process {
                        if !contents.has_ended() {
                            self.drones.kill_process(process, KILL_SIGNAL);
                        }
                    }
                } else {
                    // Never started; cancel it and resolve the entry now.
                    task.is_complete = true;
                    task.success = false;
                    self.store.put_task(&task)?;
                    self.finalize_abort(&entry)?;
                }
                continue;
            }
            self.finalize_abort(&entry)?;
        }
        Ok(())
    }

    fn finalize_abort(&mut self, entry: &HostQueueEntry) -> DispatchResult<()> {
        self.store.set_entry_status(entry.id, EntryStatus::Aborted)?;
        if let Some(host_id) = entry.host_id {
            if let Some(host) = self.store.get_host(host_id)? {
                match host.status {
                    HostStatus::Pending => {
                        self.store.set_host_status(host_id, HostStatus::Ready)?;
                    }
                    // The job already ran here; post-job maintenance is
                    // still owed even though the entry is gone.
                    HostStatus::Running | HostStatus::Gathering => {
                        self.release_host_after_job(host_id, entry.job_id)?;
                    }
                    _ => {}
                }
            }
        }
        info!(entry = entry.id, "entry aborted");
        Ok(())
    }

    /// The pidfile currently driving this entry, if the dispatcher is
    /// tracking one for its stage.
    fn active_pidfile_for_entry(&self, entry: &HostQueueEntry) -> Option<PidfileId> {
        let tag = entry.execution_subdir.as_deref()?;
        let name = match entry.status {
            EntryStatus::Running => PidfileName::Job,
            EntryStatus::Gathering => PidfileName::CrashInfo,
            EntryStatus::Parsing => PidfileName::Parse,
            _ => return None,
        };
        let id = PidfileId::new(tag, name);
        self.owners.contains_key(&id).then_some(id)
    }

    // ── Stage continuations ────────────────────────────────────────

    /// Launch crash-info and parse processes for entries parked in
    /// `Gathering`/`Parsing` without one. These continue work already
    /// admitted, so they spend tickets ahead of new job starts; only
    /// global exhaustion defers them.
    fn start_continuations(&mut self, tickets: &mut TicketPool) -> DispatchResult<()> {
        let mut gather: BTreeMap<String, Vec<EntryId>> = BTreeMap::new();
        let mut parse: BTreeMap<String, Vec<EntryId>> = BTreeMap::new();
        for entry in self.store.unfinished_entries()? {
            if entry.aborted {
                continue;
            }
            let Some(tag) = entry.execution_subdir.clone() else {
                continue;
            };
            match entry.status {
                EntryStatus::Gathering => gather.entry(tag).or_default().push(entry.id),
                EntryStatus::Parsing => parse.entry(tag).or_default().push(entry.id),
                _ => {}
            }
        }

        for (tag, ids) in gather {
            let pidfile = PidfileId::new(&tag, PidfileName::CrashInfo);
            if self.owners.contains_key(&pidfile) {
                continue;
            }
            if !tickets.try_admit(1) {
                continue;
            }
            let command = vec!["labrig-crashinfo".to_string(), tag.clone()];
            let pidfile = self
                .drones
                .execute_command(command, &tag, PidfileName::CrashInfo, 1, None)?;
            debug!(tag, "crash-info collection started");
            self.owners.insert(pidfile, PidfileOwner::Entries(ids));
        }

        for (tag, ids) in parse {
            let pidfile = PidfileId::new(&tag, PidfileName::Parse);
            if self.owners.contains_key(&pidfile) {
                continue;
            }
            if !tickets.try_admit(1) {
                continue;
            }
            let job_pidfile = PidfileId::new(&tag, PidfileName::Job);
            let command = vec!["labrig-parse".to_string(), tag.clone()];
            let pidfile = self.drones.execute_command(
                command,
                &tag,
                PidfileName::Parse,
                1,
                Some(&job_pidfile),
            )?;
            debug!(tag, "result parsing started");
            self.owners.insert(pidfile, PidfileOwner::Entries(ids));
        }
        Ok(())
    }

    // ── Entry intake ───────────────────────────────────────────────

    /// Assign hosts to queued entries and route each into its first
    /// stage: verify, reset, or directly pending. Metahost entries are
    /// resolved to a concrete host here.
    fn schedule_entry_intake(&mut self) -> DispatchResult<()> {
        let entries = self.store.unfinished_entries()?;

        // Hosts already committed: assigned to an in-flight entry or
        // targeted by an incomplete maintenance task.
        let mut busy: HashSet<HostId> = entries
            .iter()
            .filter(|e| e.status != EntryStatus::Queued)
            .filter_map(|e| e.host_id)
            .collect();
        for task in self.store.queued_tasks()? {
            busy.insert(task.host_id);
        }
        for task in self.store.active_tasks()? {
            busy.insert(task.host_id);
        }

        let mut queued: Vec<HostQueueEntry> = entries
            .into_iter()
            .filter(|e| e.status == EntryStatus::Queued && !e.aborted)
            .collect();

        let mut jobs: HashMap<JobId, Job> = HashMap::new();
        for entry in &queued {
            if !jobs.contains_key(&entry.job_id) {
                let job = self.store.get_job(entry.job_id)?.ok_or_else(|| {
                    DispatchError::Inconsistent(format!("job {} missing", entry.job_id))
                })?;
                jobs.insert(entry.job_id, job);
            }
        }
        queued.sort_by(|a, b| {
            let pa = jobs[&a.job_id].priority;
            let pb = jobs[&b.job_id].priority;
            pb.cmp(&pa).then(a.id.cmp(&b.id))
        });

        for mut entry in queued {
            let job = jobs[&entry.job_id].clone();

            let host = match entry.host_id {
                Some(host_id) => {
                    let host = self.require_host(host_id)?;
                    if host.status.is_failed() {
                        // The host was parked while this entry waited.
                        warn!(entry = entry.id, host = host_id, "host unrepairable, failing entry");
                        self.store.set_entry_status(entry.id, EntryStatus::Failed)?;
                        continue;
                    }
                    if !host.status.is_available() || host.locked || busy.contains(&host_id) {
                        continue;
                    }
                    if !job.dependencies.iter().all(|d| host.has_label(d)) {
                        continue;
                    }
                    host
                }
                None => {
                    let Some(label) = entry.meta_host.clone() else {
                        return Err(DispatchError::Inconsistent(format!(
                            "entry {} has neither host nor metahost",
                            entry.id
                        )));
                    };
                    let mut exclude: Vec<HostId> = busy.iter().copied().collect();
                    let mut found = None;
                    while let Some(host) = self.store.ready_host_with_label(&label, &exclude)? {
                        if job.dependencies.iter().all(|d| host.has_label(d)) {
                            found = Some(host);
                            break;
                        }
                        exclude.push(host.id);
                    }
                    match found {
                        Some(host) => host,
                        None => continue,
                    }
                }
            };

            busy.insert(host.id);
            entry.host_id = Some(host.id);
            entry.execution_subdir =
                Some(format!("{}-{}/{}", job.id, job.name, host.hostname));
            self.store.put_entry(&entry)?;

            let needs_verify =
                job.run_verify && host.protection != HostProtection::DoNotVerify;
            let needs_reset = job.run_reset
                || matches!(job.reboot_before, RebootPolicy::Always)
                || (matches!(job.reboot_before, RebootPolicy::IfDirty) && host.dirty);

            if needs_verify {
                self.store
                    .create_task(host.id, TaskKind::Verify, Some(entry.id), "dispatcher")?;
                self.store
                    .set_entry_status(entry.id, EntryStatus::Verifying)?;
            } else if needs_reset {
                self.store
                    .create_task(host.id, TaskKind::Reset, Some(entry.id), "dispatcher")?;
                self.store
                    .set_entry_status(entry.id, EntryStatus::Resetting)?;
            } else {
                self.store.set_entry_status(entry.id, EntryStatus::Pending)?;
                self.store.set_host_status(host.id, HostStatus::Pending)?;
            }
            info!(entry = entry.id, host = host.id, job = job.id, "entry scheduled");
        }
        Ok(())
    }

    // ── Special tasks ──────────────────────────────────────────────

    /// Start queued maintenance tasks, one per host, as capacity
    /// allows. Starting a task moves the host into the matching status.
    fn start_special_tasks(&mut self, tickets: &mut TicketPool) -> DispatchResult<()> {
        let mut tasks = self.store.queued_tasks()?;
        tasks.sort_by_key(|t| t.id);
        for mut task in tasks {
            if self.store.host_has_active_task(task.host_id)? {
                continue;
            }
            let host = self.require_host(task.host_id)?;
            let target = task.task.host_status();
            if !host_transition_allowed(host.status, target) {
                // Host still winding down a previous stage; retry later.
                continue;
            }
            if !tickets.try_admit(1) {
                break;
            }
            let tag = task_tag(&host, &task);
            let command = vec![
                "labrig-hostctl".to_string(),
                task.task.as_str().to_string(),
                host.hostname.clone(),
            ];
            let pidfile = self
                .drones
                .execute_command(command, &tag, PidfileName::Task, 1, None)?;
            task.is_active = true;
            task.time_started = Some(epoch_secs());
            self.store.put_task(&task)?;
            self.store.set_host_status(host.id, target)?;
            info!(task = task.id, host = host.id, kind = %task.task, "maintenance started");
            self.owners.insert(pidfile, PidfileOwner::Task(task.id));
        }
        Ok(())
    }

    // ── Job starts ─────────────────────────────────────────────────

    /// Move pending entries to `Starting`. A synchronous job promotes
    /// only once enough siblings are pending; the group then shares one
    /// execution tag and one job process. Pending siblings the group
    /// does not need, and pending siblings of a group that can never
    /// fill, are resolved here so their hosts return to the pool.
    fn promote_pending_groups(&mut self) -> DispatchResult<()> {
        let mut by_job: BTreeMap<JobId, Vec<HostQueueEntry>> = BTreeMap::new();
        let mut live_siblings: BTreeMap<JobId, usize> = BTreeMap::new();
        for entry in self.store.unfinished_entries()? {
            if entry.aborted {
                continue;
            }
            *live_siblings.entry(entry.job_id).or_default() += 1;
            if entry.status == EntryStatus::Pending {
                by_job.entry(entry.job_id).or_default().push(entry);
            }
        }

        for (job_id, mut pending) in by_job {
            let job = self
                .store
                .get_job(job_id)?
                .ok_or_else(|| DispatchError::Inconsistent(format!("job {job_id} missing")))?;
            if job.synch_count <= 1 {
                for entry in pending {
                    self.store.set_entry_status(entry.id, EntryStatus::Starting)?;
                }
                continue;
            }

            let wanted = job.synch_count as usize;
            if pending.len() >= wanted {
                pending.sort_by_key(|e| e.id);
                let surplus = pending.split_off(wanted);
                let tag = format!("{}-{}", job.id, job.name);
                for entry in pending {
                    let mut entry =
                        self.store.set_entry_status(entry.id, EntryStatus::Starting)?;
                    entry.execution_subdir = Some(tag.clone());
                    self.store.put_entry(&entry)?;
                }
                debug!(job = job.id, tag, "synchronous group assembled");
                // The group is full; siblings beyond it will never run.
                for entry in surplus {
                    self.resolve_unneeded_sibling(&entry)?;
                }
            } else if live_siblings[&job_id] < wanted {
                // Too few live siblings remain to ever fill the group.
                warn!(job = job.id, "synchronous group can no longer fill");
                for entry in pending {
                    self.resolve_unneeded_sibling(&entry)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve a pending sibling a synchronous job will never run and
    /// hand its host back.
    fn resolve_unneeded_sibling(&mut self, entry: &HostQueueEntry) -> DispatchResult<()> {
        let mut entry = self.store.set_entry_status(entry.id, EntryStatus::Aborted)?;
        entry.aborted = true;
        self.store.put_entry(&entry)?;
        if let Some(host_id) = entry.host_id {
            let host = self.require_host(host_id)?;
            if host.status == HostStatus::Pending {
                self.store.set_host_status(host_id, HostStatus::Ready)?;
            }
        }
        info!(entry = entry.id, job = entry.job_id, "unneeded synchronous sibling released");
        Ok(())
    }

    /// Launch the job process for each `Starting` group that fits under
    /// the remaining capacity. Groups that do not fit stay in
    /// `Starting` indefinitely; backpressure, not failure.
    fn start_job_groups(&mut self, tickets: &mut TicketPool) -> DispatchResult<()> {
        let mut groups: BTreeMap<String, Vec<HostQueueEntry>> = BTreeMap::new();
        for entry in self.store.unfinished_entries()? {
            if entry.status != EntryStatus::Starting || entry.aborted {
                continue;
            }
            let Some(tag) = entry.execution_subdir.clone() else {
                continue;
            };
            groups.entry(tag).or_default().push(entry);
        }

        for (tag, group) in groups {
            let pidfile = PidfileId::new(&tag, PidfileName::Job);
            if self.owners.contains_key(&pidfile) {
                continue;
            }
            let job_id = group[0].job_id;
            let job = self
                .store
                .get_job(job_id)?
                .ok_or_else(|| DispatchError::Inconsistent(format!("job {job_id} missing")))?;
            if job.synch_count > 1 && group.len() < job.synch_count as usize {
                // A sibling was aborted after promotion. The group must
                // run with exactly synch_count hosts, so the survivors
                // disband back to pending and wait for a replacement.
                for entry in &group {
                    let mut entry =
                        self.store.set_entry_status(entry.id, EntryStatus::Pending)?;
                    if let Some(host_id) = entry.host_id {
                        let host = self.require_host(host_id)?;
                        entry.execution_subdir =
                            Some(format!("{}-{}/{}", job.id, job.name, host.hostname));
                    }
                    self.store.put_entry(&entry)?;
                    warn!(entry = entry.id, tag, "synchronous group disbanded");
                }
                continue;
            }
            let num_processes = group.len() as u32;
            if !tickets.try_admit(num_processes) {
                continue;
            }

            let mut command = vec![
                "labrig-run".to_string(),
                "--tag".to_string(),
                tag.clone(),
            ];
            for entry in &group {
                if let Some(host_id) = entry.host_id {
                    let host = self.require_host(host_id)?;
                    command.push("--host".to_string());
                    command.push(host.hostname);
                }
            }

            let pidfile = self.drones.execute_command(
                command,
                &tag,
                PidfileName::Job,
                num_processes,
                None,
            )?;
            let now = epoch_secs();
            let mut entry_ids = Vec::with_capacity(group.len());
            for entry in &group {
                let mut entry = self.store.set_entry_status(entry.id, EntryStatus::Running)?;
                entry.started_on = Some(now);
                self.store.put_entry(&entry)?;
                entry_ids.push(entry.id);
                if let Some(host_id) = entry.host_id {
                    let mut host = self.store.set_host_status(host_id, HostStatus::Running)?;
                    host.dirty = true;
                    self.store.put_host(&host)?;
                }
            }
            info!(tag, processes = num_processes, "job process started");
            self.owners.insert(pidfile, PidfileOwner::Entries(entry_ids));
        }
        Ok(())
    }

    // ── Shared helpers ─────────────────────────────────────────────

    /// Whether a finished job process warrants crash-info collection.
    fn needs_gather(&self, contents: &PidfileContents) -> bool {
        match contents.exit_status {
            Some(ExitStatus::Signal(_)) => true,
            Some(ExitStatus::Code(code)) => code != 0 && self.config.gather_on_nonzero_exit,
            None => false,
        }
    }

    /// Release a host once its part of the job is over: schedule
    /// post-job cleanup when the reboot policy asks for it, otherwise
    /// return the host to the ready pool.
    fn release_host_after_job(&mut self, host_id: HostId, job_id: JobId) -> DispatchResult<()> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| DispatchError::Inconsistent(format!("job {job_id} missing")))?;
        let host = self.require_host(host_id)?;
        let cleanup_due = matches!(job.reboot_after, RebootPolicy::Always)
            || (matches!(job.reboot_after, RebootPolicy::IfDirty) && host.dirty);
        if cleanup_due {
            self.store
                .create_task(host_id, TaskKind::Cleanup, None, "dispatcher")?;
        } else {
            self.store.set_host_status(host_id, HostStatus::Ready)?;
        }
        Ok(())
    }

    /// Send an entry back to the queue after a verify/reset failure, or
    /// fail it once the requeue ceiling is spent. A metahost entry
    /// loses its host assignment so the next intake picks a different
    /// host carrying the label.
    fn requeue_after_failure(&mut self, entry: HostQueueEntry) -> DispatchResult<()> {
        if entry.requeue_count >= self.config.max_requeue_limit {
            self.store.set_entry_status(entry.id, EntryStatus::Failed)?;
            warn!(entry = entry.id, "entry failed after exhausting requeues");
            return Ok(());
        }
        let mut entry = self.store.set_entry_status(entry.id, EntryStatus::Queued)?;
        entry.requeue_count += 1;
        if entry.meta_host.is_some() {
            entry.host_id = None;
            entry.execution_subdir = None;
        }
        self.store.put_entry(&entry)?;
        Ok(())
    }

    fn require_entry(&self, id: EntryId) -> DispatchResult<HostQueueEntry> {
        self.store
            .get_entry(id)?
            .ok_or_else(|| DispatchError::Inconsistent(format!("entry {id} missing")))
    }

    fn require_host(&self, id: HostId) -> DispatchResult<Host> {
        self.store
            .get_host(id)?
            .ok_or_else(|| DispatchError::Inconsistent(format!("host {id} missing")))
    }
}

/// Working-directory tag for a maintenance task's process.
pub(crate) fn task_tag(host: &Host, task: &SpecialTask) -> String {
    format!("hosts/{}/{}-{}", host.hostname, task.id, task.task)
}
