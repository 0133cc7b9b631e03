//! Dispatcher error types.

use thiserror::Error;

/// Errors that can occur while driving the scheduler.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("state store error: {0}")]
    State(#[from] labrig_state::StateError),

    #[error("drone error: {0}")]
    Drone(#[from] labrig_drone::DroneError),

    /// A tracked pidfile or task references a record that no longer
    /// matches the persisted state.
    #[error("inconsistent scheduler state: {0}")]
    Inconsistent(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
