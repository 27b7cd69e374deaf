//! Error types for the lockrun CLI.
//!
//! Uses thiserror for derive macros. Store and heartbeat failures keep their
//! own structured types and are wrapped here where they cross into the
//! supervisor.

use crate::exit_codes;
use crate::heartbeat::HeartbeatError;
use crate::locks::LockLost;
use crate::store::StoreError;
use thiserror::Error;

/// Main error type for lockrun operations.
///
/// Each variant maps to a specific exit code.
#[derive(Error, Debug)]
pub enum LockrunError {
    /// Invalid or missing configuration; the supervisor refuses to start.
    #[error("{0}")]
    Usage(String),

    /// The lock could not be acquired because of a store failure.
    #[error("Lock acquisition failed: {0}")]
    Acquire(#[source] StoreError),

    /// A watch saw the key overwritten while waiting for it to be released.
    #[error("Protocol violation on '{key}': {detail}")]
    ProtocolViolation { key: String, detail: String },

    /// The lock was not held by this owner when releasing it.
    #[error("Lock release failed: {0}")]
    Unlock(#[source] StoreError),

    /// The lock was lost while held.
    #[error("{0}")]
    LockLost(LockLost),

    /// The child process could not be spawned, signalled or reaped.
    #[error("Child process error: {0}")]
    ChildProcess(String),

    /// The heartbeat prober gave up on the child.
    #[error("Heartbeat failed: {0}")]
    Heartbeat(#[from] HeartbeatError),
}

impl LockrunError {
    /// Returns the appropriate exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            LockrunError::Usage(_) => exit_codes::SUCCESS,
            LockrunError::Acquire(_) => exit_codes::ACQUIRE_FAILURE,
            LockrunError::ProtocolViolation { .. } => exit_codes::ACQUIRE_FAILURE,
            LockrunError::Unlock(_) => exit_codes::ACQUIRE_FAILURE,
            LockrunError::LockLost(_) => exit_codes::LOCK_LOST,
            LockrunError::ChildProcess(_) => exit_codes::CHILD_FAILURE,
            LockrunError::Heartbeat(_) => exit_codes::HEARTBEAT_FAILURE,
        }
    }
}

/// Result type alias for lockrun operations.
pub type Result<T> = std::result::Result<T, LockrunError>;
