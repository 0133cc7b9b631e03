//! SimDroneManager — in-process execution backend.
//!
//! Backs the daemon and every test. Commands are
//! recorded rather than spawned; tests drive completion explicitly via
//! [`SimDroneManager::finish`]. Capacity accounting, kill semantics,
//! and the unregister-then-drop rule match the contract a real
//! distributed backend must honor.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{DroneError, DroneResult};
use crate::manager::DroneManager;
use crate::pidfile::{ExitStatus, PidfileContents, PidfileId, PidfileName, Process};

#[derive(Debug, Clone)]
struct PidfileRecord {
    command: Vec<String>,
    num_processes: u32,
    contents: PidfileContents,
    paired_with: Option<PidfileId>,
    /// Queued unregistration; the record is dropped on the next refresh.
    unregister_pending: bool,
}

#[derive(Default)]
struct Inner {
    records: HashMap<PidfileId, PidfileRecord>,
    /// Every launch ever issued, kept even after the record is dropped.
    launch_log: Vec<(PidfileId, Vec<String>)>,
    capacity: u32,
    next_pid: u32,
}

/// In-memory drone backend with explicit completion control.
pub struct SimDroneManager {
    inner: Mutex<Inner>,
}

impl SimDroneManager {
    /// Create a backend with the given global process capacity.
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                launch_log: Vec::new(),
                capacity,
                next_pid: 0,
            }),
        }
    }

    /// Change the global capacity ceiling.
    pub fn set_capacity(&self, capacity: u32) {
        self.inner.lock().unwrap().capacity = capacity;
    }

    /// Mark a running process as finished with the given exit status.
    /// `num_tests_failed` is what a parse process would report.
    pub fn finish(&self, id: &PidfileId, exit: ExitStatus, num_tests_failed: Option<u32>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(id) {
            if record.contents.exit_status.is_none() {
                record.contents.exit_status = Some(exit);
                record.contents.num_tests_failed = num_tests_failed;
            }
        }
    }

    /// All commands started so far (including finished ones), in no
    /// particular order.
    pub fn started_commands(&self) -> Vec<(PidfileId, Vec<String>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|(_, r)| r.contents.process.is_some())
            .map(|(id, r)| (id.clone(), r.command.clone()))
            .collect()
    }

    /// Every launch ever issued, in order, surviving unregistration.
    pub fn launch_history(&self) -> Vec<(PidfileId, Vec<String>)> {
        self.inner.lock().unwrap().launch_log.clone()
    }

    /// Currently running (started, not yet finished) pidfile ids.
    pub fn running_pidfiles(&self) -> Vec<PidfileId> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|(_, r)| r.contents.process.is_some() && r.contents.exit_status.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of tracked pidfile records. Zero once every completed
    /// piece of work has been observed and unregistered.
    pub fn registered_count(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    /// The pidfile a follow-on process was paired with, if any.
    pub fn paired_with(&self, id: &PidfileId) -> Option<PidfileId> {
        let inner = self.inner.lock().unwrap();
        inner.records.get(id).and_then(|r| r.paired_with.clone())
    }
}

impl DroneManager for SimDroneManager {
    fn execute_command(
        &self,
        command: Vec<String>,
        working_directory: &str,
        pidfile_name: PidfileName,
        num_processes: u32,
        paired_with: Option<&PidfileId>,
    ) -> DroneResult<PidfileId> {
        let id = PidfileId::new(working_directory, pidfile_name);
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.records.get(&id) {
            if existing.contents.process.is_some() {
                return Err(DroneError::AlreadyRunning(id.to_string()));
            }
        }
        inner.next_pid += 1;
        let process = Process {
            drone: "sim-drone".to_string(),
            pid: inner.next_pid,
        };
        debug!(pidfile = %id, pid = process.pid, "command started");
        inner.launch_log.push((id.clone(), command.clone()));
        inner.records.insert(
            id.clone(),
            PidfileRecord {
                command,
                num_processes,
                contents: PidfileContents {
                    process: Some(process),
                    exit_status: None,
                    num_tests_failed: None,
                },
                paired_with: paired_with.cloned(),
                unregister_pending: false,
            },
        );
        Ok(id)
    }

    fn get_pidfile_contents(&self, id: &PidfileId) -> PidfileContents {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(id)
            .map(|r| r.contents.clone())
            .unwrap_or_default()
    }

    fn kill_process(&self, process: &Process, signal: i32) {
        let mut inner = self.inner.lock().unwrap();
        for record in inner.records.values_mut() {
            let matches = record.contents.process.as_ref() == Some(process);
            if matches && record.contents.exit_status.is_none() {
                record.contents.exit_status = Some(ExitStatus::Signal(signal));
                debug!(pid = process.pid, signal, "process killed");
            }
        }
    }

    fn register_pidfile(&self, id: &PidfileId) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.entry(id.clone()).or_insert(PidfileRecord {
            command: Vec::new(),
            num_processes: 0,
            contents: PidfileContents::default(),
            paired_with: None,
            unregister_pending: false,
        });
    }

    fn unregister_pidfile(&self, id: &PidfileId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(id) {
            record.unregister_pending = true;
        }
    }

    fn total_running_processes(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .filter(|r| r.contents.process.is_some() && r.contents.exit_status.is_none())
            .map(|r| r.num_processes)
            .sum()
    }

    fn max_runnable_processes(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        let running: u32 = inner
            .records
            .values()
            .filter(|r| r.contents.process.is_some() && r.contents.exit_status.is_none())
            .map(|r| r.num_processes)
            .sum();
        inner.capacity.saturating_sub(running)
    }

    fn refresh(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.retain(|_, r| !r.unregister_pending);
    }
}
