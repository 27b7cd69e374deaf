//! Lock state and loss notification types.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Lifecycle of one lock instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Never acquired.
    Idle,
    /// Reading the key, writing it, or waiting for it to be released.
    Acquiring,
    /// The store holds this owner's id under the key.
    Held,
    /// Rewriting the key to extend its lease.
    Refreshing,
    /// Ownership was observed to be gone. No writes until the next `lock()`.
    Lost,
    /// Released by `unlock()`.
    Released,
}

impl LockState {
    /// Whether this owner currently believes it holds the key.
    pub fn is_held(&self) -> bool {
        matches!(self, LockState::Held | LockState::Refreshing)
    }

    /// Whether the current acquisition is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LockState::Lost | LockState::Released)
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::Idle => write!(f, "idle"),
            LockState::Acquiring => write!(f, "acquiring"),
            LockState::Held => write!(f, "held"),
            LockState::Refreshing => write!(f, "refreshing"),
            LockState::Lost => write!(f, "lost"),
            LockState::Released => write!(f, "released"),
        }
    }
}

/// Why a held lock was declared lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossCause {
    /// The key now holds another owner's id.
    ForeignValue(String),
    /// The key was deleted or expired under us.
    Released,
    /// A lease refresh failed its compare-and-swap.
    RefreshConflict,
}

impl std::fmt::Display for LossCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossCause::ForeignValue(owner) => write!(f, "now held by '{}'", owner),
            LossCause::Released => write!(f, "key released"),
            LossCause::RefreshConflict => write!(f, "refresh conflict"),
        }
    }
}

/// Asynchronous notification that a held lock is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLost {
    pub key: String,
    pub owner_id: String,
    /// Index of the last write known to belong to this owner.
    pub last_index: Option<u64>,
    pub cause: LossCause,
    pub observed_at: DateTime<Utc>,
}

impl LockLost {
    pub fn new(key: &str, owner_id: &str, last_index: Option<u64>, cause: LossCause) -> Self {
        Self {
            key: key.to_string(),
            owner_id: owner_id.to_string(),
            last_index,
            cause,
            observed_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for LockLost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lock '{}' held by '{}' was lost ({})",
            self.key, self.owner_id, self.cause
        )?;
        if let Some(index) = self.last_index {
            write!(f, " after index {}", index)?;
        }
        Ok(())
    }
}

/// Identity and lease settings for a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Store key to hold.
    pub key: String,
    /// Value written to the key while held.
    pub owner_id: String,
    /// Lease length in whole seconds.
    pub ttl_secs: u64,
    /// Delay between the end of one refresh and the start of the next.
    /// Defaults to half the TTL.
    pub refresh_interval: Option<Duration>,
}

impl LockOptions {
    pub fn new(key: impl Into<String>, owner_id: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            key: key.into(),
            owner_id: owner_id.into(),
            ttl_secs,
            refresh_interval: None,
        }
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// The refresh interval in effect: the explicit one, or half the TTL.
    pub fn effective_refresh_interval(&self) -> Duration {
        self.refresh_interval
            .unwrap_or_else(|| Duration::from_secs(self.ttl_secs) / 2)
    }
}
