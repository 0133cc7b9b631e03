//! End-to-end scheduler behavior, driven tick by tick against the
//! in-memory store and simulated drone backend.

use std::sync::Arc;

use labrig_dispatch::{Dispatcher, DispatcherConfig, MemoryNotifier};
use labrig_drone::{DroneManager, ExitStatus, PidfileName, SimDroneManager};
use labrig_state::{
    EntryId, EntryStatus, HostProtection, HostStatus, JobSpec, RebootPolicy, StateStore,
};

struct Lab {
    store: StateStore,
    drones: Arc<SimDroneManager>,
    notifier: Arc<MemoryNotifier>,
    dispatcher: Dispatcher,
}

fn lab(capacity: u32) -> Lab {
    let store = StateStore::open_in_memory().unwrap();
    let drones = Arc::new(SimDroneManager::new(capacity));
    let notifier = Arc::new(MemoryNotifier::default());
    let dispatcher = Dispatcher::new(
        store.clone(),
        drones.clone(),
        notifier.clone(),
        DispatcherConfig::default(),
    );
    Lab {
        store,
        drones,
        notifier,
        dispatcher,
    }
}

/// Finish every running process of the given kind.
fn finish_all(lab: &Lab, name: PidfileName, exit: ExitStatus, tests_failed: Option<u32>) {
    for id in lab.drones.running_pidfiles() {
        if id.name == name {
            lab.drones.finish(&id, exit, tests_failed);
        }
    }
}

/// Tick until nothing is left in flight, succeeding every process.
fn settle(lab: &mut Lab) {
    for _ in 0..32 {
        lab.dispatcher.tick().unwrap();
        for id in lab.drones.running_pidfiles() {
            let tests_failed = (id.name == PidfileName::Parse).then_some(0);
            lab.drones.finish(&id, ExitStatus::Code(0), tests_failed);
        }
        if lab.store.unfinished_entries().unwrap().is_empty() {
            break;
        }
    }
    // Drain queued unregistrations.
    lab.dispatcher.tick().unwrap();
    lab.dispatcher.tick().unwrap();
}

fn entry_status(lab: &Lab, id: EntryId) -> EntryStatus {
    lab.store.get_entry(id).unwrap().unwrap().status
}

#[test]
fn no_pidfiles_leak_after_a_completed_job() {
    let mut lab = lab(10);
    let a = lab
        .store
        .add_host("rig-1", vec![], HostProtection::NoProtection)
        .unwrap();
    let b = lab
        .store
        .add_host("rig-2", vec![], HostProtection::NoProtection)
        .unwrap();
    let mut spec = JobSpec::simple("full-cycle", vec![a.id, b.id]);
    spec.run_verify = true;
    spec.reboot_after = RebootPolicy::Always;
    let (_, entries) = lab.store.create_job(spec).unwrap();

    settle(&mut lab);

    for entry in entries {
        assert_eq!(entry_status(&lab, entry.id), EntryStatus::Completed);
    }
    assert_eq!(lab.drones.registered_count(), 0);
    assert_eq!(lab.drones.total_running_processes(), 0);
}

#[test]
fn no_pidfiles_leak_after_an_aborted_job() {
    let mut lab = lab(10);
    let host = lab
        .store
        .add_host("rig-1", vec![], HostProtection::NoProtection)
        .unwrap();
    let (job, entries) = lab
        .store
        .create_job(JobSpec::simple("cut-short", vec![host.id]))
        .unwrap();

    lab.dispatcher.tick().unwrap();
    assert_eq!(entry_status(&lab, entries[0].id), EntryStatus::Running);

    lab.store.abort_job(job.id).unwrap();
    settle(&mut lab);

    assert_eq!(entry_status(&lab, entries[0].id), EntryStatus::Aborted);
    assert_eq!(lab.drones.registered_count(), 0);
}

#[test]
fn synchronous_siblings_run_in_lockstep() {
    let mut lab = lab(10);
    let a = lab
        .store
        .add_host("rig-1", vec![], HostProtection::NoProtection)
        .unwrap();
    let b = lab
        .store
        .add_host("rig-2", vec![], HostProtection::NoProtection)
        .unwrap();
    let mut spec = JobSpec::simple("sync", vec![a.id, b.id]);
    spec.synch_count = 2;
    spec.run_verify = true;
    let (_, entries) = lab.store.create_job(spec).unwrap();

    lab.dispatcher.tick().unwrap();
    let task_pidfiles: Vec<_> = lab
        .drones
        .running_pidfiles()
        .into_iter()
        .filter(|p| p.name == PidfileName::Task)
        .collect();
    assert_eq!(task_pidfiles.len(), 2);

    // One sibling verified, the other still verifying: nobody runs.
    lab.drones
        .finish(&task_pidfiles[0], ExitStatus::Code(0), None);
    lab.dispatcher.tick().unwrap();
    let statuses: Vec<_> = entries.iter().map(|e| entry_status(&lab, e.id)).collect();
    assert!(statuses.contains(&EntryStatus::Pending));
    assert!(statuses.contains(&EntryStatus::Verifying));
    assert!(!statuses.contains(&EntryStatus::Running));

    // Second verify lands: the whole group starts as one process pair.
    lab.drones
        .finish(&task_pidfiles[1], ExitStatus::Code(0), None);
    lab.dispatcher.tick().unwrap();
    for entry in &entries {
        assert_eq!(entry_status(&lab, entry.id), EntryStatus::Running);
    }
    let jobs: Vec<_> = lab
        .drones
        .running_pidfiles()
        .into_iter()
        .filter(|p| p.name == PidfileName::Job)
        .collect();
    assert_eq!(jobs.len(), 1);
    assert_eq!(lab.drones.total_running_processes(), 2);

    // The shared process completes the whole group.
    finish_all(&lab, PidfileName::Job, ExitStatus::Code(0), None);
    lab.dispatcher.tick().unwrap();
    finish_all(&lab, PidfileName::Parse, ExitStatus::Code(0), Some(0));
    lab.dispatcher.tick().unwrap();
    for entry in &entries {
        assert_eq!(entry_status(&lab, entry.id), EntryStatus::Completed);
    }
}

#[test]
fn surplus_sync_sibling_is_released_when_the_group_fills() {
    let mut lab = lab(10);
    let mut hosts = Vec::new();
    for i in 0..3 {
        hosts.push(
            lab.store
                .add_host(&format!("rig-{i}"), vec![], HostProtection::NoProtection)
                .unwrap(),
        );
    }
    let mut spec = JobSpec::simple("pair", hosts.iter().map(|h| h.id).collect());
    spec.synch_count = 2;
    let (_, entries) = lab.store.create_job(spec).unwrap();

    settle(&mut lab);

    // Two siblings form the group and complete; the third was never
    // needed and resolves without holding its host.
    let statuses: Vec<_> = entries.iter().map(|e| entry_status(&lab, e.id)).collect();
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == EntryStatus::Completed)
            .count(),
        2
    );
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == EntryStatus::Aborted)
            .count(),
        1
    );
    for host in lab.store.list_hosts().unwrap() {
        assert_eq!(host.status, HostStatus::Ready);
    }
    assert_eq!(lab.drones.registered_count(), 0);
}

#[test]
fn partially_aborted_sync_group_never_launches_undersized() {
    let mut lab = lab(0);
    let a = lab
        .store
        .add_host("rig-1", vec![], HostProtection::NoProtection)
        .unwrap();
    let b = lab
        .store
        .add_host("rig-2", vec![], HostProtection::NoProtection)
        .unwrap();
    let mut spec = JobSpec::simple("halved", vec![a.id, b.id]);
    spec.synch_count = 2;
    let (_, entries) = lab.store.create_job(spec).unwrap();

    // Zero capacity parks the assembled group in Starting.
    lab.dispatcher.tick().unwrap();
    for entry in &entries {
        assert_eq!(entry_status(&lab, entry.id), EntryStatus::Starting);
    }

    // One sibling is aborted before the group ever launched.
    lab.store.abort_entry(entries[0].id).unwrap();
    lab.drones.set_capacity(10);
    for _ in 0..3 {
        lab.dispatcher.tick().unwrap();
    }

    // The survivor can never re-pair, so it resolves too; nothing ran.
    for entry in &entries {
        assert_eq!(entry_status(&lab, entry.id), EntryStatus::Aborted);
    }
    assert!(lab.drones.launch_history().is_empty());
    assert_eq!(lab.drones.total_running_processes(), 0);
    for host in lab.store.list_hosts().unwrap() {
        assert_eq!(host.status, HostStatus::Ready);
    }
}

#[test]
fn zero_capacity_defers_all_starts_until_raised() {
    let mut lab = lab(0);
    let mut entry_ids = Vec::new();
    for i in 0..3 {
        let host = lab
            .store
            .add_host(&format!("rig-{i}"), vec![], HostProtection::NoProtection)
            .unwrap();
        let (_, entries) = lab
            .store
            .create_job(JobSpec::simple(&format!("j{i}"), vec![host.id]))
            .unwrap();
        entry_ids.push(entries[0].id);
    }

    for _ in 0..3 {
        lab.dispatcher.tick().unwrap();
    }
    for &id in &entry_ids {
        assert_eq!(entry_status(&lab, id), EntryStatus::Starting);
    }
    assert!(lab.drones.started_commands().is_empty());

    // Capacity covers every eligible start: all admitted next tick.
    lab.drones.set_capacity(3);
    lab.dispatcher.tick().unwrap();
    for &id in &entry_ids {
        assert_eq!(entry_status(&lab, id), EntryStatus::Running);
    }
}

#[test]
fn aborting_a_queued_synchronous_job_launches_nothing() {
    let mut lab = lab(10);
    let a = lab
        .store
        .add_host("rig-1", vec![], HostProtection::NoProtection)
        .unwrap();
    let b = lab
        .store
        .add_host("rig-2", vec![], HostProtection::NoProtection)
        .unwrap();
    let mut spec = JobSpec::simple("never-ran", vec![a.id, b.id]);
    spec.synch_count = 2;
    let (job, entries) = lab.store.create_job(spec).unwrap();

    lab.store.abort_job(job.id).unwrap();
    lab.dispatcher.tick().unwrap();

    for entry in &entries {
        assert_eq!(entry_status(&lab, entry.id), EntryStatus::Aborted);
    }
    assert!(lab.drones.started_commands().is_empty());
    assert_eq!(lab.drones.registered_count(), 0);
}

#[test]
fn do_not_verify_host_treats_cleanup_failure_as_benign() {
    let mut lab = lab(10);
    let host = lab
        .store
        .add_host("rig-1", vec![], HostProtection::DoNotVerify)
        .unwrap();
    let mut spec = JobSpec::simple("lenient", vec![host.id]);
    spec.run_verify = true;
    spec.reboot_after = RebootPolicy::Always;
    let (_, entries) = lab.store.create_job(spec).unwrap();

    // Verify is skipped outright.
    lab.dispatcher.tick().unwrap();
    assert_eq!(entry_status(&lab, entries[0].id), EntryStatus::Running);

    finish_all(&lab, PidfileName::Job, ExitStatus::Code(0), None);
    lab.dispatcher.tick().unwrap();
    // Post-job cleanup fails on the protected host.
    finish_all(&lab, PidfileName::Task, ExitStatus::Code(1), None);
    finish_all(&lab, PidfileName::Parse, ExitStatus::Code(0), Some(0));
    lab.dispatcher.tick().unwrap();

    assert_eq!(entry_status(&lab, entries[0].id), EntryStatus::Completed);
    let host = lab.store.get_host(host.id).unwrap().unwrap();
    assert_eq!(host.status, HostStatus::Ready);
    // No repair was escalated.
    assert!(lab.store.queued_tasks().unwrap().is_empty());
    assert!(lab.store.active_tasks().unwrap().is_empty());
    assert!(lab.notifier.sent().is_empty());
}

#[test]
fn repeated_repair_failures_park_the_host() {
    let mut lab = lab(10);
    let host = lab
        .store
        .add_host("rig-1", vec![], HostProtection::NoProtection)
        .unwrap();
    let mut spec = JobSpec::simple("unlucky", vec![host.id]);
    spec.run_verify = true;
    let (_, entries) = lab.store.create_job(spec).unwrap();

    // Verify fails, then every repair attempt fails. The default limit
    // allows three consecutive repair failures before parking.
    for _ in 0..5 {
        lab.dispatcher.tick().unwrap();
        finish_all(&lab, PidfileName::Task, ExitStatus::Code(1), None);
    }
    lab.dispatcher.tick().unwrap();

    let host = lab.store.get_host(host.id).unwrap().unwrap();
    assert_eq!(host.status, HostStatus::RepairFailed);
    assert_eq!(host.repair_failures, 4);
    assert!(!lab.notifier.sent().is_empty());
    // The waiting entry can never be placed on this host again.
    assert_eq!(entry_status(&lab, entries[0].id), EntryStatus::Failed);

    // No further repairs are auto-scheduled on later ticks.
    for _ in 0..3 {
        lab.dispatcher.tick().unwrap();
    }
    assert!(lab.store.queued_tasks().unwrap().is_empty());
    assert_eq!(
        lab.store.get_host(host.id).unwrap().unwrap().status,
        HostStatus::RepairFailed
    );
}

#[test]
fn metahost_entry_moves_to_a_second_host_after_verify_failure() {
    let mut lab = lab(10);
    let a = lab
        .store
        .add_host(
            "rig-1",
            vec!["pool:bvt".into()],
            HostProtection::NoProtection,
        )
        .unwrap();
    let b = lab
        .store
        .add_host(
            "rig-2",
            vec!["pool:bvt".into()],
            HostProtection::NoProtection,
        )
        .unwrap();
    let mut spec = JobSpec::simple("floating", vec![]);
    spec.meta_hosts = vec!["pool:bvt".into()];
    spec.run_verify = true;
    let (_, entries) = lab.store.create_job(spec).unwrap();
    let entry = entries[0].id;

    lab.dispatcher.tick().unwrap();
    assert_eq!(
        lab.store.get_entry(entry).unwrap().unwrap().host_id,
        Some(a.id)
    );

    // First host fails verify: it goes to repair while the entry is
    // reassigned to the second label-holder.
    finish_all(&lab, PidfileName::Task, ExitStatus::Code(1), None);
    lab.dispatcher.tick().unwrap();
    let reassigned = lab.store.get_entry(entry).unwrap().unwrap();
    assert_eq!(reassigned.host_id, Some(b.id));
    assert_eq!(reassigned.status, EntryStatus::Verifying);
    assert_eq!(
        lab.store.get_host(a.id).unwrap().unwrap().status,
        HostStatus::Repairing
    );

    finish_all(&lab, PidfileName::Task, ExitStatus::Code(1), None);
    lab.dispatcher.tick().unwrap();
    // Only the repair on rig-1 failed here; rig-2's verify also got the
    // failing exit above, sending the entry around once more. Let it
    // land on whichever ready host remains and succeed this time.
    for _ in 0..4 {
        finish_all(&lab, PidfileName::Task, ExitStatus::Code(0), None);
        lab.dispatcher.tick().unwrap();
        if entry_status(&lab, entry) == EntryStatus::Running {
            break;
        }
    }
    assert_eq!(entry_status(&lab, entry), EntryStatus::Running);
}

#[test]
fn restart_adopts_surviving_processes_without_relaunching() {
    let mut lab = lab(10);
    let host = lab
        .store
        .add_host("rig-1", vec![], HostProtection::NoProtection)
        .unwrap();
    let (_, entries) = lab
        .store
        .create_job(JobSpec::simple("interrupted", vec![host.id]))
        .unwrap();
    let entry = entries[0].id;

    lab.dispatcher.tick().unwrap();
    assert_eq!(entry_status(&lab, entry), EntryStatus::Running);

    // Dispatcher dies; the drone layer and the store survive.
    let mut replacement = Dispatcher::new(
        lab.store.clone(),
        lab.drones.clone(),
        Arc::new(MemoryNotifier::default()),
        DispatcherConfig::default(),
    );
    replacement.recover().unwrap();
    lab.dispatcher = replacement;

    finish_all(&lab, PidfileName::Job, ExitStatus::Code(0), None);
    lab.dispatcher.tick().unwrap();
    finish_all(&lab, PidfileName::Parse, ExitStatus::Code(0), Some(0));
    lab.dispatcher.tick().unwrap();

    assert_eq!(entry_status(&lab, entry), EntryStatus::Completed);
    // Exactly one job process over the whole life of the job.
    let job_launches = lab
        .drones
        .launch_history()
        .into_iter()
        .filter(|(id, _)| id.name == PidfileName::Job)
        .count();
    assert_eq!(job_launches, 1);
}

#[test]
fn restart_with_lost_processes_rewinds_and_relaunches() {
    let store = StateStore::open_in_memory().unwrap();
    let host = store
        .add_host("rig-1", vec![], HostProtection::NoProtection)
        .unwrap();
    let (_, entries) = store
        .create_job(JobSpec::simple("survivor", vec![host.id]))
        .unwrap();
    let entry = entries[0].id;

    let first_drones = Arc::new(SimDroneManager::new(10));
    let mut first = Dispatcher::new(
        store.clone(),
        first_drones.clone(),
        Arc::new(MemoryNotifier::default()),
        DispatcherConfig::default(),
    );
    first.tick().unwrap();
    assert_eq!(
        store.get_entry(entry).unwrap().unwrap().status,
        EntryStatus::Running
    );

    // Machine reboot: both the dispatcher and every drone process are
    // gone, only the store remains.
    let drones = Arc::new(SimDroneManager::new(10));
    let notifier = Arc::new(MemoryNotifier::default());
    let dispatcher = Dispatcher::new(
        store.clone(),
        drones.clone(),
        notifier.clone(),
        DispatcherConfig::default(),
    );
    let mut lab = Lab {
        store,
        drones,
        notifier,
        dispatcher,
    };
    lab.dispatcher.recover().unwrap();
    assert_eq!(entry_status(&lab, entry), EntryStatus::Starting);

    settle(&mut lab);
    assert_eq!(entry_status(&lab, entry), EntryStatus::Completed);
    assert_eq!(lab.drones.registered_count(), 0);
}

#[test]
fn restart_resolves_aborted_parse_without_relaunching() {
    let store = StateStore::open_in_memory().unwrap();
    let host = store
        .add_host("rig-1", vec![], HostProtection::NoProtection)
        .unwrap();
    let (_, entries) = store
        .create_job(JobSpec::simple("posthumous", vec![host.id]))
        .unwrap();
    let entry = entries[0].id;

    let first_drones = Arc::new(SimDroneManager::new(10));
    let mut first = Dispatcher::new(
        store.clone(),
        first_drones.clone(),
        Arc::new(MemoryNotifier::default()),
        DispatcherConfig::default(),
    );
    first.tick().unwrap();
    for id in first_drones.running_pidfiles() {
        first_drones.finish(&id, ExitStatus::Code(0), None);
    }
    first.tick().unwrap();
    assert_eq!(
        store.get_entry(entry).unwrap().unwrap().status,
        EntryStatus::Parsing
    );

    // The abort lands, then the machine reboots mid-parse: every
    // process is lost, only the store remains.
    store.abort_entry(entry).unwrap();
    let drones = Arc::new(SimDroneManager::new(10));
    let notifier = Arc::new(MemoryNotifier::default());
    let dispatcher = Dispatcher::new(
        store.clone(),
        drones.clone(),
        notifier.clone(),
        DispatcherConfig::default(),
    );
    let mut lab = Lab {
        store,
        drones,
        notifier,
        dispatcher,
    };
    lab.dispatcher.recover().unwrap();

    // Resolved outright, never parsed posthumously.
    assert_eq!(entry_status(&lab, entry), EntryStatus::Aborted);
    lab.dispatcher.tick().unwrap();
    lab.dispatcher.tick().unwrap();
    assert!(lab.drones.launch_history().is_empty());
    assert_eq!(lab.drones.registered_count(), 0);
    assert_eq!(
        lab.store.get_host(host.id).unwrap().unwrap().status,
        HostStatus::Ready
    );
}
