use crate::config::Config;
use crate::locks::{Lock, LockOptions};
use crate::store::memory::MemoryStore;
use crate::store::{Node, SetOptions, Store, StoreError, WatchSubscription};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const TEST_KEY: &str = "/locks/job";

/// A lock on [`TEST_KEY`] backed by `store`.
pub(crate) fn lock_for(store: &MemoryStore, owner: &str, ttl_secs: u64) -> Lock {
    Lock::new(
        Arc::new(store.clone()),
        LockOptions::new(TEST_KEY, owner, ttl_secs),
    )
}

/// Same as [`lock_for`], shareable with spawned tasks.
pub(crate) fn shared_lock_for(store: &MemoryStore, owner: &str, ttl_secs: u64) -> Arc<Lock> {
    Arc::new(lock_for(store, owner, ttl_secs))
}

/// A store whose every call fails as if the endpoint were down.
pub(crate) struct UnreachableStore;

#[async_trait]
impl Store for UnreachableStore {
    async fn get(&self, _key: &str) -> Result<Node, StoreError> {
        Err(StoreError::Transport("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: &str, _options: SetOptions) -> Result<Node, StoreError> {
        Err(StoreError::Transport("connection refused".to_string()))
    }

    async fn compare_and_delete(&self, _key: &str, _value: &str) -> Result<Node, StoreError> {
        Err(StoreError::Transport("connection refused".to_string()))
    }

    fn watch(&self, key: &str, _from_index: u64) -> WatchSubscription {
        WatchSubscription::new(key, stream::empty().boxed())
    }
}

/// A valid supervisor configuration running `command` under [`TEST_KEY`].
pub(crate) fn test_config(owner: &str, command: &[&str]) -> Config {
    Config {
        ttl: 10,
        key: TEST_KEY.to_string(),
        owner: owner.to_string(),
        kill_timeout_secs: 2,
        command: command.iter().map(|arg| arg.to_string()).collect(),
        ..Config::default()
    }
}

/// `sh -c <script>` as a command line.
pub(crate) fn shell(script: &str) -> Vec<&str> {
    vec!["sh", "-c", script]
}

/// Poll until `key` holds `value`, for at most five seconds.
pub(crate) async fn wait_for_value(store: &MemoryStore, key: &str, value: &str) {
    for _ in 0..250 {
        if store.value(key).as_deref() == Some(value) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("'{}' never held '{}'", key, value);
}
