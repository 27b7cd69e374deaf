//! Distributed mutual-exclusion lock on a single store key.
//!
//! # Protocol
//!
//! A lock is held by writing the owner id under the key with a TTL:
//! - Absent key: create it with `prevExist=false`.
//! - Key holds our owner id: extend the lease with a compare-and-swap.
//! - Key holds another id: watch from after its index until a delete,
//!   expire or compare-and-delete, then start over.
//!
//! While held, the lease is refreshed every refresh interval (half the TTL
//! unless configured) and the key is watched for foreign writes. A refresh
//! never overlaps another write from the same lock.
//!
//! # Loss
//!
//! Ownership can disappear without any call from us: the key may expire, be
//! deleted or be overwritten. The lock then moves to [`LockState::Lost`],
//! stops writing and sends one [`LockLost`] to every subscriber.
//!
//! # Release
//!
//! `unlock()` deletes the key only if it still holds our owner id.

mod engine;
mod types;
mod watch;


pub use engine::Lock;
pub use types::{LockLost, LockOptions, LockState, LossCause};
