//! Restart reconciliation.
//!
//! The owner map is in-memory, so a restarted dispatcher must rebuild
//! it from persisted state before its first tick. Every entry or task
//! recorded mid-stage derives the pidfile its process would have been
//! tracked under; if the drone layer still knows the process, the work
//! is adopted as-is, otherwise the record is rewound to the start of
//! its stage so the normal tick logic relaunches it.

use std::collections::BTreeMap;

use tracing::{info, warn};

use labrig_drone::{PidfileId, PidfileName};
use labrig_state::{EntryId, EntryStatus, HostStatus};

use crate::dispatcher::{task_tag, Dispatcher, PidfileOwner};
use crate::error::{DispatchError, DispatchResult};

impl Dispatcher {
    /// Reconcile persisted state against the drone layer's current
    /// process records. Call once after construction, before the first
    /// tick. Idempotent: adopting the same work twice is a no-op.
    pub fn recover(&mut self) -> DispatchResult<()> {
        self.recover_entry_stages()?;
        self.recover_active_tasks()?;
        self.recover_orphaned_maintenance()?;
        Ok(())
    }

    /// Entries persisted in a process-backed stage: adopt the process
    /// if it survived, otherwise rewind the stage.
    fn recover_entry_stages(&mut self) -> DispatchResult<()> {
        let mut by_pidfile: BTreeMap<PidfileId, Vec<EntryId>> = BTreeMap::new();
        for entry in self.store.unfinished_entries()? {
            let name = match entry.status {
                EntryStatus::Running => PidfileName::Job,
                EntryStatus::Gathering => PidfileName::CrashInfo,
                EntryStatus::Parsing => PidfileName::Parse,
                _ => continue,
            };
            let Some(tag) = entry.execution_subdir.as_deref() else {
                continue;
            };
            by_pidfile
                .entry(PidfileId::new(tag, name))
                .or_default()
                .push(entry.id);
        }

        for (pidfile, entry_ids) in by_pidfile {
            self.drones.register_pidfile(&pidfile);
            let contents = self.drones.get_pidfile_contents(&pidfile);
            if contents.process.is_some() {
                info!(pidfile = %pidfile, entries = entry_ids.len(), "adopted surviving process");
                self.owners.insert(pidfile, PidfileOwner::Entries(entry_ids));
                continue;
            }

            // The process disappeared with the old dispatcher.
            self.drones.unregister_pidfile(&pidfile);
            for id in entry_ids {
                let entry = self.store.get_entry(id)?.ok_or_else(|| {
                    DispatchError::Inconsistent(format!("entry {id} missing"))
                })?;
                match entry.status {
                    // Relaunched from the start of the stage.
                    EntryStatus::Running => {
                        warn!(entry = id, "job process lost, rewinding to start");
                        self.store.set_entry_status(id, EntryStatus::Starting)?;
                    }
                    // An aborted entry mid-parse is resolved outright
                    // rather than parsed posthumously.
                    EntryStatus::Parsing if entry.aborted => {
                        self.store.set_entry_status(id, EntryStatus::Aborted)?;
                    }
                    // Gathering/Parsing entries keep their status; the
                    // continuation pass relaunches the stage process.
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Maintenance tasks persisted as active: adopt or send back to the
    /// task queue.
    fn recover_active_tasks(&mut self) -> DispatchResult<()> {
        for mut task in self.store.active_tasks()? {
            let host = self.store.get_host(task.host_id)?.ok_or_else(|| {
                DispatchError::Inconsistent(format!("host {} missing", task.host_id))
            })?;
            let pidfile = PidfileId::new(&task_tag(&host, &task), PidfileName::Task);
            self.drones.register_pidfile(&pidfile);
            let contents = self.drones.get_pidfile_contents(&pidfile);
            if contents.process.is_some() {
                info!(task = task.id, pidfile = %pidfile, "adopted surviving maintenance");
                self.owners.insert(pidfile, PidfileOwner::Task(task.id));
            } else {
                warn!(task = task.id, host = host.id, "maintenance process lost, requeueing task");
                self.drones.unregister_pidfile(&pidfile);
                task.is_active = false;
                task.time_started = None;
                self.store.put_task(&task)?;
            }
        }
        Ok(())
    }

    /// Entries persisted mid-verify/reset with no surviving task record
    /// at all go back to the queue; their hosts return to the pool.
    fn recover_orphaned_maintenance(&mut self) -> DispatchResult<()> {
        for entry in self.store.unfinished_entries()? {
            if !matches!(
                entry.status,
                EntryStatus::Verifying | EntryStatus::Resetting
            ) {
                continue;
            }
            if self.store.unfinished_task_for_entry(entry.id)?.is_some() {
                continue;
            }
            warn!(entry = entry.id, "no task backs this entry, requeueing");
            let mut entry = self.store.set_entry_status(entry.id, EntryStatus::Queued)?;
            if let Some(host_id) = entry.host_id {
                if let Some(host) = self.store.get_host(host_id)? {
                    if matches!(
                        host.status,
                        HostStatus::Verifying | HostStatus::Resetting
                    ) {
                        self.store.set_host_status(host_id, HostStatus::Ready)?;
                    }
                }
            }
            if entry.meta_host.is_some() {
                entry.host_id = None;
                entry.execution_subdir = None;
                self.store.put_entry(&entry)?;
            }
        }
        Ok(())
    }
}
