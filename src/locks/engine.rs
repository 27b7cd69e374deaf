//! Lock engine: acquisition, lease refresh, release and loss detection.

use super::types::{LockLost, LockOptions, LockState, LossCause};
use super::watch::{ReleaseWait, wait_for_release, watch_for_loss};
use crate::error::{LockrunError, Result};
use crate::store::{SetOptions, Store, StoreError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered loss notifications per subscriber.
const LOST_CHANNEL_CAPACITY: usize = 16;

/// Pause before re-reading the key after a release watch failed.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// Caller-initiated `lock()`: create, refresh or wait for release.
    Acquire,
    /// Scheduled lease refresh: anything but our own value is a loss.
    Refresh,
}

#[derive(Debug)]
struct Shared {
    state: LockState,
    last_index: Option<u64>,
    /// The task running the refresh timer and loss watch, if any.
    maintenance: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn Store>,
    key: String,
    owner_id: String,
    ttl_secs: u64,
    refresh_interval: Duration,
    shared: Mutex<Shared>,
    /// Serializes acquisitions, refreshes and release.
    serial: tokio::sync::Mutex<()>,
    lost_tx: broadcast::Sender<LockLost>,
}

/// One owner's claim on one store key.
///
/// While held, a background task extends the lease every refresh interval
/// and watches the key for foreign writes. Loss is reported through
/// [`Lock::subscribe`], never as the result of a call that is not running
/// when it happens.
///
/// Dropping the lock stops the background task without releasing the key;
/// the lease then expires on its own.
pub struct Lock {
    inner: Arc<Inner>,
}

impl Lock {
    pub fn new(store: Arc<dyn Store>, options: LockOptions) -> Self {
        let refresh_interval = options.effective_refresh_interval();
        let (lost_tx, _) = broadcast::channel(LOST_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                store,
                key: options.key,
                owner_id: options.owner_id,
                ttl_secs: options.ttl_secs,
                refresh_interval,
                shared: Mutex::new(Shared {
                    state: LockState::Idle,
                    last_index: None,
                    maintenance: None,
                }),
                serial: tokio::sync::Mutex::new(()),
                lost_tx,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    pub fn state(&self) -> LockState {
        self.inner.shared().state
    }

    /// Index of the last write known to belong to this owner.
    pub fn last_index(&self) -> Option<u64> {
        self.inner.shared().last_index
    }

    /// Subscribe to loss notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LockLost> {
        self.inner.lost_tx.subscribe()
    }

    /// Acquire the lock, or refresh it if this owner already holds it.
    ///
    /// Waits for as long as another owner holds the key. Returns an error if
    /// the store fails, if a peer overwrites the key while we wait, or if a
    /// refresh of our own entry loses a race (in which case a loss
    /// notification is also sent).
    pub async fn lock(&self) -> Result<()> {
        let _serial = self.inner.serial.lock().await;
        self.inner.stop_maintenance();
        let result = self.inner.attempt(Attempt::Acquire).await;
        // A failed refresh of a held lock leaves it held.
        if self.inner.state().is_held() {
            self.inner.start_maintenance();
        }
        result
    }

    /// Stop refreshing and delete the key if it still holds our owner id.
    pub async fn unlock(&self) -> Result<()> {
        let _serial = self.inner.serial.lock().await;
        self.inner.stop_maintenance();

        let result = self
            .inner
            .store
            .compare_and_delete(&self.inner.key, &self.inner.owner_id)
            .await;

        let mut shared = self.inner.shared();
        shared.state = LockState::Released;
        match result {
            Ok(node) => {
                shared.last_index = Some(node.modified_index);
                info!(
                    key = %self.inner.key,
                    owner = %self.inner.owner_id,
                    index = node.modified_index,
                    "lock released"
                );
                Ok(())
            }
            Err(err) => Err(LockrunError::Unlock(err)),
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.inner.stop_maintenance();
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.inner.key)
            .field("owner_id", &self.inner.owner_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn state(&self) -> LockState {
        self.shared().state
    }

    fn set_state(&self, state: LockState) {
        self.shared().state = state;
    }

    /// Index to watch from while held; `None` once the lock is not held.
    fn held_index(&self) -> Option<u64> {
        let shared = self.shared();
        if shared.state.is_held() {
            shared.last_index
        } else {
            None
        }
    }

    fn stop_maintenance(&self) {
        if let Some(handle) = self.shared().maintenance.take() {
            handle.abort();
        }
    }

    fn start_maintenance(self: &Arc<Self>) {
        let handle = tokio::spawn(Arc::clone(self).maintain());
        if let Some(previous) = self.shared().maintenance.replace(handle) {
            previous.abort();
        }
    }

    /// Enter `Acquiring` or `Refreshing`; returns the state before.
    fn begin(&self) -> LockState {
        let mut shared = self.shared();
        let previous = shared.state;
        shared.state = if previous.is_held() {
            LockState::Refreshing
        } else {
            LockState::Acquiring
        };
        previous
    }

    fn mark_held(&self, index: u64) {
        let mut shared = self.shared();
        shared.state = LockState::Held;
        shared.last_index = Some(index);
    }

    /// Undo `begin` after a store failure.
    fn fail(&self, previous: LockState, err: StoreError) -> LockrunError {
        self.set_state(match previous {
            LockState::Held | LockState::Refreshing => LockState::Held,
            LockState::Acquiring => LockState::Idle,
            other => other,
        });
        LockrunError::Acquire(err)
    }

    /// Enter `Lost` and notify subscribers, once per acquisition.
    fn declare_lost(&self, cause: LossCause) -> LockrunError {
        let (lost, already_lost) = {
            let mut shared = self.shared();
            let already_lost = shared.state == LockState::Lost;
            shared.state = LockState::Lost;
            (
                LockLost::new(&self.key, &self.owner_id, shared.last_index, cause),
                already_lost,
            )
        };

        if !already_lost {
            warn!(
                key = %self.key,
                owner = %self.owner_id,
                last_index = ?lost.last_index,
                cause = %lost.cause,
                "lock lost"
            );
            let _ = self.lost_tx.send(lost.clone());
        }
        LockrunError::LockLost(lost)
    }

    /// One run of the acquisition algorithm, looping through waits.
    async fn attempt(&self, mode: Attempt) -> Result<()> {
        // Lower bound for the next watch after the store reported its
        // history at our cursor as cleared.
        let mut resume_from = 0;

        loop {
            let previous = self.begin();
            let refreshing = mode == Attempt::Refresh || previous.is_held();

            let current = match self.store.get(&self.key).await {
                Ok(node) => Some(node),
                Err(StoreError::NotFound { .. }) => None,
                Err(err) => return Err(self.fail(previous, err)),
            };

            let wait_from = match current {
                None if refreshing => return Err(self.declare_lost(LossCause::Released)),
                None => {
                    let created = self
                        .store
                        .set(&self.key, &self.owner_id, SetOptions::create(self.ttl_secs))
                        .await;
                    match created {
                        Ok(node) => {
                            self.mark_held(node.modified_index);
                            info!(
                                key = %self.key,
                                owner = %self.owner_id,
                                index = node.modified_index,
                                ttl = self.ttl_secs,
                                "lock acquired"
                            );
                            return Ok(());
                        }
                        Err(StoreError::ConditionFailed { index, .. }) => {
                            debug!(key = %self.key, index, "lost creation race");
                            index + 1
                        }
                        Err(err) => return Err(self.fail(previous, err)),
                    }
                }
                Some(node) if node.is_owned_by(&self.owner_id) => {
                    let swapped = self
                        .store
                        .set(
                            &self.key,
                            &self.owner_id,
                            SetOptions::swap(self.ttl_secs, &self.owner_id),
                        )
                        .await;
                    match swapped {
                        Ok(node) => {
                            self.mark_held(node.modified_index);
                            debug!(key = %self.key, index = node.modified_index, "lease refreshed");
                            return Ok(());
                        }
                        Err(StoreError::ConditionFailed { .. } | StoreError::NotFound { .. }) => {
                            return Err(self.declare_lost(LossCause::RefreshConflict));
                        }
                        Err(err) => return Err(self.fail(previous, err)),
                    }
                }
                Some(node) if refreshing => {
                    let holder = node.value.unwrap_or_default();
                    return Err(self.declare_lost(LossCause::ForeignValue(holder)));
                }
                Some(node) => {
                    debug!(
                        key = %self.key,
                        holder = node.value.as_deref().unwrap_or_default(),
                        index = node.modified_index,
                        "lock held by another owner"
                    );
                    node.modified_index + 1
                }
            };

            let from_index = wait_from.max(resume_from);
            match wait_for_release(&*self.store, &self.key, from_index).await {
                Ok(ReleaseWait::Released) => {}
                Ok(ReleaseWait::Stale { store_index }) => resume_from = store_index + 1,
                Ok(ReleaseWait::Interrupted) => {
                    resume_from = from_index;
                    tokio::time::sleep(WATCH_RETRY_DELAY).await;
                }
                Err(err) => {
                    self.set_state(LockState::Idle);
                    return Err(err);
                }
            }
        }
    }

    /// Refresh timer and loss watch for one held lock.
    ///
    /// Runs until the lock is lost, or until it is aborted by `lock()`,
    /// `unlock()` or drop.
    async fn maintain(self: Arc<Self>) {
        loop {
            let Some(index) = self.held_index() else {
                return;
            };
            // `sleep` saturates instead of overflowing on very long intervals.
            let refresh_due = tokio::time::sleep(self.refresh_interval);
            tokio::pin!(refresh_due);

            tokio::select! {
                _ = &mut refresh_due => {}
                outcome = watch_for_loss(&*self.store, &self.key, &self.owner_id, index + 1) => {
                    match outcome {
                        Ok(cause) => {
                            self.declare_lost(cause);
                            return;
                        }
                        Err(err) => {
                            warn!(key = %self.key, error = %err, "loss watch failed, relying on refresh");
                            refresh_due.as_mut().await;
                        }
                    }
                }
            }

            let _serial = self.serial.lock().await;
            if !self.state().is_held() {
                return;
            }
            match self.attempt(Attempt::Refresh).await {
                Ok(()) => {}
                Err(LockrunError::LockLost(_)) => return,
                Err(err) => {
                    warn!(key = %self.key, error = %err, "lease refresh failed, retrying");
                }
            }
        }
    }
}
