//! Store client facade for lockrun.
//!
//! The lock engine only needs four operations from the replicated store:
//! - `get` a key
//! - conditional `set` (TTL, must-not-exist, compare-and-swap on value)
//! - `compare_and_delete`
//! - `watch` a key from a given modification index
//!
//! These are expressed by the [`Store`] trait. [`EtcdClient`] speaks the etcd
//! v2 key API over HTTP; the in-memory store backs the test suite.
//!
//! # Events
//!
//! Every write produces an event tagged with its action. Release-class
//! actions (`delete`, `expire`, `compareAndDelete`) free a key; a plain
//! `set` overwrites it unconditionally.

mod error;
mod etcd;
#[cfg(test)]
pub mod memory;
mod types;
mod watch;

// Re-export public API
pub use error::StoreError;
pub use etcd::EtcdClient;
pub use types::{Node, SetOptions, StoreAction, StoreEvent};
pub use watch::WatchSubscription;

use async_trait::async_trait;

/// Operations the lock engine performs against the store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a key. Fails with [`StoreError::NotFound`] if it does not exist.
    async fn get(&self, key: &str) -> Result<Node, StoreError>;

    /// Write a key, subject to the preconditions in `options`.
    ///
    /// A failed precondition is reported as [`StoreError::ConditionFailed`],
    /// except a compare-and-swap against a missing key, which is
    /// [`StoreError::NotFound`].
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<Node, StoreError>;

    /// Delete a key only if its current value equals `value`.
    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<Node, StoreError>;

    /// Subscribe to changes of `key` starting at `from_index` (inclusive).
    ///
    /// The subscription is lazy; nothing is sent to the store until the
    /// first event is requested. Dropping it unsubscribes.
    fn watch(&self, key: &str, from_index: u64) -> WatchSubscription;
}
