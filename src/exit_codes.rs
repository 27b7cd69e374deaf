//! Exit code constants for the lockrun CLI.
//!
//! - 0: Success, or a usage no-op (help, missing required option)
//! - 1: Lock acquisition failure
//! - 2: Lock lost while the child was running
//! - 3: Child process spawn/kill failure
//! - 4: Heartbeat protocol failure
//! - 128+N: Child or supervisor terminated by signal N
//!
//! A child that exits normally passes its own exit code through.

/// Successful execution, or nothing to do.
pub const SUCCESS: i32 = 0;

/// The lock could not be acquired.
pub const ACQUIRE_FAILURE: i32 = 1;

/// The lock was lost while held.
pub const LOCK_LOST: i32 = 2;

/// The child process could not be spawned or killed.
pub const CHILD_FAILURE: i32 = 3;

/// The child stopped answering heartbeats, or answered wrongly.
pub const HEARTBEAT_FAILURE: i32 = 4;

/// Base added to a signal number for signal-caused termination.
pub const SIGNAL_BASE: i32 = 128;

/// Exit code for termination by the given signal number.
pub fn for_signal(signal: i32) -> i32 {
    SIGNAL_BASE + signal
}
