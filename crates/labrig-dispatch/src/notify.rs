//! Alerting seam for fatal scheduler conditions.
//!
//! Fire-and-forget: the dispatcher never waits on a notification and a
//! failed delivery never affects scheduling.

use std::sync::Mutex;

use tracing::error;

/// Sink for operator-facing alerts (a host parked in `RepairFailed`,
/// inconsistent persisted state).
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, message: &str);
}

/// Emits alerts through the tracing pipeline.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, message: &str) {
        error!(subject, message, "scheduler alert");
    }
}

/// Records alerts in memory so tests can assert on them.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, subject: &str, message: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), message.to_string()));
    }
}
