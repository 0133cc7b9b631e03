//! Error types for the drone layer.

use thiserror::Error;

/// Result type alias for drone operations.
pub type DroneResult<T> = Result<T, DroneError>;

/// Errors that can occur when issuing commands to the drone layer.
#[derive(Debug, Error)]
pub enum DroneError {
    #[error("a command is already tracked under {0}")]
    AlreadyRunning(String),
}
