//! Ordered teardown for a supervised session.

use crate::error::{LockrunError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, warn};

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Named teardown actions, run last-registered first, at most once.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, CleanupAction)>,
    ran: bool,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, name: &str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.actions
            .push((name.to_string(), Box::new(move || action().boxed())));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn has_run(&self) -> bool {
        self.ran
    }

    /// Run every action in reverse registration order. A failing action is
    /// logged and the rest still run; the errors are returned in the order
    /// they happened. Later calls do nothing.
    pub async fn run(&mut self) -> Vec<LockrunError> {
        if self.ran {
            debug!("cleanup already ran");
            return Vec::new();
        }
        self.ran = true;

        let mut failures = Vec::new();
        while let Some((name, action)) = self.actions.pop() {
            debug!(action = %name, "running cleanup");
            if let Err(err) = action().await {
                warn!(action = %name, error = %err, "cleanup action failed");
                failures.push(err);
            }
        }
        failures
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.actions.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("CleanupStack")
            .field("actions", &names)
            .field("ran", &self.ran)
            .finish()
    }
}
