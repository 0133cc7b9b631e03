//! Dispatcher configuration.
//!
//! Retry ceilings and the gathering classification are configuration,
//! not contracts: deployments tune them per lab.

use serde::{Deserialize, Serialize};

/// Tunable dispatcher parameters, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Consecutive repair failures after which a host is parked in
    /// `RepairFailed` and excluded from automatic scheduling.
    pub max_repair_limit: u32,

    /// Times an entry may be re-queued after a verify/reset failure
    /// before it is failed outright.
    pub max_requeue_limit: u32,

    /// Global process-capacity ceiling handed to the drone layer.
    pub max_processes: u32,

    /// When true, any nonzero job exit code triggers crash-info
    /// gathering; otherwise only signal-terminated jobs gather.
    pub gather_on_nonzero_exit: bool,

    /// Seconds between dispatcher ticks in the daemon.
    pub tick_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_repair_limit: 3,
            max_requeue_limit: 3,
            max_processes: 100,
            gather_on_nonzero_exit: false,
            tick_interval_secs: 5,
        }
    }
}

impl DispatcherConfig {
    /// Parse a configuration from TOML text. Missing fields fall back
    /// to defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
