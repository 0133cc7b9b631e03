//! Pidfile records — the tracked lifecycle of one external process.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pidfile a process writes into its working directory. Each
/// stage of a queue entry uses a distinct name, so one working
/// directory can host a job process and its follow-on processes
/// without collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidfileName {
    /// The main job (test-execution) process.
    Job,
    /// Crash-info collection after an unclean job exit.
    CrashInfo,
    /// Result parsing.
    Parse,
    /// A special (maintenance) task process.
    Task,
}

impl PidfileName {
    pub fn file_name(&self) -> &'static str {
        match self {
            PidfileName::Job => ".job_execute",
            PidfileName::CrashInfo => ".crashinfo_execute",
            PidfileName::Parse => ".parser_execute",
            PidfileName::Task => ".task_execute",
        }
    }
}

/// Key of a pidfile record: the working directory the command ran in
/// plus the pidfile name within it. Ordered by tag then name so keyed
/// collections iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PidfileId {
    pub execution_tag: String,
    pub name: PidfileName,
}

impl PidfileId {
    pub fn new(execution_tag: &str, name: PidfileName) -> Self {
        Self {
            execution_tag: execution_tag.to_string(),
            name,
        }
    }
}

impl fmt::Display for PidfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.execution_tag, self.name.file_name())
    }
}

/// Opaque handle to a process running on some drone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub drone: String,
    pub pid: u32,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Code(i32),
    /// Terminated by the given signal (including dispatcher kills).
    Signal(i32),
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

/// Polled view of a pidfile record.
///
/// `process` is present once execution has started; `exit_status`
/// present means the process has ended. `num_tests_failed` is reported
/// by parse processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidfileContents {
    pub process: Option<Process>,
    pub exit_status: Option<ExitStatus>,
    pub num_tests_failed: Option<u32>,
}

impl PidfileContents {
    /// Whether the process has started and ended.
    pub fn has_ended(&self) -> bool {
        self.exit_status.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_names_are_distinct() {
        let names = [
            PidfileName::Job,
            PidfileName::CrashInfo,
            PidfileName::Parse,
            PidfileName::Task,
        ];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a.file_name(), b.file_name());
            }
        }
    }

    #[test]
    fn same_tag_different_name_is_a_different_id() {
        let job = PidfileId::new("1-bvt/rig-1", PidfileName::Job);
        let parse = PidfileId::new("1-bvt/rig-1", PidfileName::Parse);
        assert_ne!(job, parse);
    }

    #[test]
    fn ids_order_by_tag_then_name() {
        let mut ids = vec![
            PidfileId::new("2-bvt/rig-1", PidfileName::Job),
            PidfileId::new("1-bvt/rig-1", PidfileName::Parse),
            PidfileId::new("1-bvt/rig-1", PidfileName::Job),
        ];
        ids.sort();
        assert_eq!(ids[0].execution_tag, "1-bvt/rig-1");
        assert_eq!(ids[0].name, PidfileName::Job);
        assert_eq!(ids[2].execution_tag, "2-bvt/rig-1");
    }

    #[test]
    fn exit_status_success() {
        assert!(ExitStatus::Code(0).is_success());
        assert!(!ExitStatus::Code(1).is_success());
        assert!(!ExitStatus::Signal(9).is_success());
    }

    #[test]
    fn empty_contents_have_not_ended() {
        let contents = PidfileContents::default();
        assert!(!contents.has_ended());
        assert!(contents.process.is_none());
    }
}
