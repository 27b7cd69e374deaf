//! Watch subscriptions.

use super::error::StoreError;
use super::types::StoreEvent;
use futures::StreamExt;
use futures::stream::BoxStream;

/// A live subscription to change events on one key.
///
/// Yields events in index order. Dropping the subscription unsubscribes.
pub struct WatchSubscription {
    key: String,
    events: BoxStream<'static, Result<StoreEvent, StoreError>>,
}

impl WatchSubscription {
    pub fn new(key: &str, events: BoxStream<'static, Result<StoreEvent, StoreError>>) -> Self {
        Self {
            key: key.to_string(),
            events,
        }
    }

    /// Wait for the next event on the key.
    ///
    /// A stream that ends without an error is reported as a transport
    /// failure, since a watch never completes on its own.
    pub async fn next_event(&mut self) -> Result<StoreEvent, StoreError> {
        match self.events.next().await {
            Some(event) => event,
            None => Err(StoreError::Transport(format!(
                "watch on '{}' closed",
                self.key
            ))),
        }
    }
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
