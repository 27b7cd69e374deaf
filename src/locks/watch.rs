//! One-shot watches used by the lock engine.
//!
//! Both helpers open a subscription, consume events until the single one
//! they care about, and drop the subscription on return.

use super::types::LossCause;
use crate::error::{LockrunError, Result};
use crate::store::{Store, StoreError};
use tracing::{debug, trace, warn};

/// Outcome of waiting for a held key to be freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ReleaseWait {
    /// A delete, expire or compare-and-delete was observed.
    Released,
    /// The store no longer has history at the requested index; the caller
    /// should read the key again and watch from after `store_index`.
    Stale { store_index: u64 },
    /// The watch failed before anything relevant arrived; the caller should
    /// read the key again and resume from the same index.
    Interrupted,
}

/// Wait for a release-class event on `key` at or after `from_index`.
///
/// Refreshes by the current holder are skipped. An unconditional `set` means
/// a peer is writing the key without the lock protocol and fails the wait.
pub(super) async fn wait_for_release(
    store: &dyn Store,
    key: &str,
    from_index: u64,
) -> Result<ReleaseWait> {
    debug!(key, from_index, "waiting for lock release");
    let mut watch = store.watch(key, from_index);

    loop {
        match watch.next_event().await {
            Ok(event) if event.action.is_release() => {
                debug!(key, index = event.index(), action = %event.action, "lock released");
                return Ok(ReleaseWait::Released);
            }
            Ok(event) if event.action.is_overwrite() => {
                return Err(LockrunError::ProtocolViolation {
                    key: key.to_string(),
                    detail: format!(
                        "key overwritten with '{}' at index {} while waiting for release",
                        event.value().unwrap_or_default(),
                        event.index()
                    ),
                });
            }
            Ok(event) => {
                trace!(key, index = event.index(), action = %event.action, "ignoring event");
            }
            Err(StoreError::IndexCleared { index }) => {
                debug!(key, from_index, store_index = index, "watch index cleared");
                return Ok(ReleaseWait::Stale { store_index: index });
            }
            Err(err) => {
                warn!(key, from_index, error = %err, "release watch interrupted");
                return Ok(ReleaseWait::Interrupted);
            }
        }
    }
}

/// Watch a held key from `from_index` and return as soon as it stops
/// holding `owner_id`.
///
/// Events carrying `owner_id` are this owner's own refreshes and are skipped.
pub(super) async fn watch_for_loss(
    store: &dyn Store,
    key: &str,
    owner_id: &str,
    from_index: u64,
) -> std::result::Result<LossCause, StoreError> {
    trace!(key, from_index, "arming loss detection");
    let mut watch = store.watch(key, from_index);

    loop {
        let event = watch.next_event().await?;
        match event.value() {
            Some(value) if value == owner_id => {
                trace!(key, index = event.index(), "own refresh observed");
            }
            Some(value) => return Ok(LossCause::ForeignValue(value.to_string())),
            None => return Ok(LossCause::Released),
        }
    }
}
