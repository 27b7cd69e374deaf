//! In-process store used by the test suite.
//!
//! Mirrors the etcd v2 semantics the lock relies on: a global index bumped by
//! every write, TTL expiry, conditional writes and watch-from-index backed by
//! an event history. It also records every write attempt so tests can assert
//! on what an engine sent.

use super::Store;
use super::error::StoreError;
use super::types::{Node, SetOptions, StoreAction, StoreEvent};
use super::watch::WatchSubscription;
use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

/// A write attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub key: String,
    pub value: String,
    pub action: StoreAction,
}

#[derive(Debug, Default)]
struct MemoryState {
    index: u64,
    entries: HashMap<String, Node>,
    history: Vec<StoreEvent>,
    compacted_through: u64,
    writes: Vec<WriteRecord>,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    events: broadcast::Sender<StoreEvent>,
    latency: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight write counter when a write finishes or is
/// abandoned.
struct InFlight<'a>(&'a Mutex<MemoryState>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock().unwrap_or_else(|poison| poison.into_inner());
        state.in_flight -= 1;
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            events,
            latency: Duration::ZERO,
        }
    }

    /// Delay every conditional write by `latency` before applying it.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Current value of `key`, if any.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().entries.get(key).and_then(|node| node.value.clone())
    }

    /// Every write attempt so far.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// Write attempts carrying `value`.
    pub fn writes_of(&self, value: &str) -> Vec<WriteRecord> {
        self.writes()
            .into_iter()
            .filter(|record| record.value == value)
            .collect()
    }

    /// Highest number of writes that were ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Unconditional overwrite without a lease, as a misbehaving peer would.
    pub fn put(&self, key: &str, value: &str) -> Node {
        let mut state = self.lock();
        let previous = state.entries.get(key).cloned();
        self.commit(&mut state, StoreAction::Set, key, Some(value), None, previous)
    }

    /// Unconditional delete, as an operator would.
    pub fn delete(&self, key: &str) -> Option<Node> {
        let mut state = self.lock();
        let previous = state.entries.get(key).cloned()?;
        Some(self.commit(&mut state, StoreAction::Delete, key, None, None, Some(previous)))
    }

    /// Forget all history; watches from any earlier index now fail.
    pub fn compact(&self) {
        let mut state = self.lock();
        state.compacted_through = state.index;
        state.history.clear();
    }

    async fn begin_write(&self) -> InFlight<'_> {
        {
            let mut state = self.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        let guard = InFlight(&self.state);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }

    /// Apply a write, record the event and schedule expiry.
    fn commit(
        &self,
        state: &mut MemoryState,
        action: StoreAction,
        key: &str,
        value: Option<&str>,
        ttl: Option<u64>,
        previous: Option<Node>,
    ) -> Node {
        state.index += 1;
        let index = state.index;

        let node = Node {
            key: key.to_string(),
            value: value.map(str::to_string),
            ttl: ttl.map(|t| t as i64),
            modified_index: index,
            created_index: match (&previous, action) {
                (Some(prev), StoreAction::CompareAndSwap | StoreAction::Update) => {
                    prev.created_index
                }
                (Some(prev), _) if action.is_release() => prev.created_index,
                _ => index,
            },
        };

        if action.is_release() {
            state.entries.remove(key);
        } else {
            state.entries.insert(key.to_string(), node.clone());
        }

        let event = StoreEvent {
            action,
            node: node.clone(),
            prev_node: previous,
        };
        state.history.push(event.clone());
        let _ = self.events.send(event);

        if let Some(ttl) = ttl {
            self.schedule_expiry(key, index, Duration::from_secs(ttl));
        }

        node
    }

    fn schedule_expiry(&self, key: &str, index: u64, ttl: Duration) {
        let store = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut state = store.lock();
            let current = state.entries.get(&key).cloned();
            if let Some(node) = current
                && node.modified_index == index
            {
                store.commit(&mut state, StoreAction::Expire, &key, None, None, Some(node));
            }
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Node, StoreError> {
        self.lock()
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<Node, StoreError> {
        let _in_flight = self.begin_write().await;
        let mut state = self.lock();

        let action = if options.prev_exist == Some(false) {
            StoreAction::Create
        } else if options.prev_value.is_some() {
            StoreAction::CompareAndSwap
        } else if options.prev_exist == Some(true) {
            StoreAction::Update
        } else {
            StoreAction::Set
        };
        state.writes.push(WriteRecord {
            key: key.to_string(),
            value: value.to_string(),
            action,
        });

        let current = state.entries.get(key).cloned();
        match (&current, &options) {
            (Some(_), SetOptions {
                prev_exist: Some(false),
                ..
            }) => {
                return Err(StoreError::ConditionFailed {
                    key: key.to_string(),
                    cause: "Key already exists".to_string(),
                    index: state.index,
                });
            }
            (None, SetOptions {
                prev_exist: Some(true),
                ..
            })
            | (None, SetOptions {
                prev_value: Some(_),
                ..
            }) => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                });
            }
            (Some(node), SetOptions {
                prev_value: Some(expected),
                ..
            }) if !node.is_owned_by(expected) => {
                return Err(StoreError::ConditionFailed {
                    key: key.to_string(),
                    cause: format!(
                        "[{} != {}]",
                        expected,
                        node.value.as_deref().unwrap_or_default()
                    ),
                    index: state.index,
                });
            }
            _ => {}
        }

        Ok(self.commit(&mut state, action, key, Some(value), options.ttl, current))
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<Node, StoreError> {
        let _in_flight = self.begin_write().await;
        let mut state = self.lock();
        state.writes.push(WriteRecord {
            key: key.to_string(),
            value: value.to_string(),
            action: StoreAction::CompareAndDelete,
        });

        let current = state
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
        if !current.is_owned_by(value) {
            return Err(StoreError::ConditionFailed {
                key: key.to_string(),
                cause: format!(
                    "[{} != {}]",
                    value,
                    current.value.as_deref().unwrap_or_default()
                ),
                index: state.index,
            });
        }

        Ok(self.commit(
            &mut state,
            StoreAction::CompareAndDelete,
            key,
            None,
            None,
            Some(current),
        ))
    }

    fn watch(&self, key: &str, from_index: u64) -> WatchSubscription {
        let state = self.lock();

        if from_index <= state.compacted_through {
            let err = StoreError::IndexCleared { index: state.index };
            return WatchSubscription::new(key, stream::once(future::ready(Err(err))).boxed());
        }

        // Subscribe while holding the state lock so no event falls between
        // the history snapshot and the live feed.
        let receiver = self.events.subscribe();
        let backlog: Vec<Result<StoreEvent, StoreError>> = state
            .history
            .iter()
            .filter(|event| event.node.key == key && event.index() >= from_index)
            .cloned()
            .map(Ok)
            .collect();
        let seen = state.index;
        drop(state);

        let watched = key.to_string();
        let live = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| {
            future::ready(
                event.node.key == watched && event.index() >= from_index && event.index() > seen,
            )
        })
        .map(Ok);

        WatchSubscription::new(key, stream::iter(backlog).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "/locks/job";

    #[tokio::test]
    async fn create_fails_when_key_exists() {
        let store = MemoryStore::new();
        let node = store.set(KEY, "a", SetOptions::create(10)).await.unwrap();
        assert_eq!(node.modified_index, 1);

        let err = store.set(KEY, "b", SetOptions::create(10)).await.unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { index: 1, .. }));
        assert_eq!(store.value(KEY).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn swap_checks_previous_value() {
        let store = MemoryStore::new();
        store.set(KEY, "a", SetOptions::create(10)).await.unwrap();

        let err = store.set(KEY, "b", SetOptions::swap(10, "b")).await.unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));

        let node = store.set(KEY, "a", SetOptions::swap(10, "a")).await.unwrap();
        assert_eq!(node.modified_index, 2);
        assert_eq!(node.created_index, 1);

        let err = store
            .set("/locks/other", "a", SetOptions::swap(10, "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_value() {
        let store = MemoryStore::new();
        store.set(KEY, "a", SetOptions::create(10)).await.unwrap();

        let err = store.compare_and_delete(KEY, "b").await.unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));

        store.compare_and_delete(KEY, "a").await.unwrap();
        assert_eq!(store.value(KEY), None);

        let err = store.compare_and_delete(KEY, "a").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = MemoryStore::new();
        store.set(KEY, "a", SetOptions::create(2)).await.unwrap();

        let mut watch = store.watch(KEY, 2);
        let event = watch.next_event().await.unwrap();

        assert_eq!(event.action, StoreAction::Expire);
        assert_eq!(event.prev_node.unwrap().value.as_deref(), Some("a"));
        assert_eq!(store.value(KEY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_postpones_expiry() {
        let store = MemoryStore::new();
        store.set(KEY, "a", SetOptions::create(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        store.set(KEY, "a", SetOptions::swap(2, "a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(store.value(KEY).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn watch_replays_history_then_follows_live_events() {
        let store = MemoryStore::new();
        store.put(KEY, "a");
        store.put("/locks/other", "x");
        store.put(KEY, "b");

        let mut watch = store.watch(KEY, 1);
        assert_eq!(watch.next_event().await.unwrap().index(), 1);
        assert_eq!(watch.next_event().await.unwrap().index(), 3);

        store.delete(KEY);
        let event = watch.next_event().await.unwrap();
        assert_eq!(event.action, StoreAction::Delete);
        assert_eq!(event.index(), 4);
    }

    #[tokio::test]
    async fn watch_from_compacted_index_fails() {
        let store = MemoryStore::new();
        store.put(KEY, "a");
        store.compact();

        let err = store.watch(KEY, 1).next_event().await.unwrap_err();
        assert_eq!(err, StoreError::IndexCleared { index: 1 });

        store.put(KEY, "b");
        let event = store.watch(KEY, 2).next_event().await.unwrap();
        assert_eq!(event.index(), 2);
    }

    #[tokio::test]
    async fn records_write_attempts() {
        let store = MemoryStore::new();
        store.set(KEY, "a", SetOptions::create(10)).await.unwrap();
        let _ = store.set(KEY, "b", SetOptions::create(10)).await;

        assert_eq!(store.writes().len(), 2);
        assert_eq!(store.writes_of("b")[0].action, StoreAction::Create);
        assert_eq!(store.max_in_flight(), 1);
    }
}
