//! Store error taxonomy.

use thiserror::Error;

/// etcd v2 error code: key not found.
pub(crate) const KEY_NOT_FOUND: u32 = 100;
/// etcd v2 error code: compare failed.
pub(crate) const TEST_FAILED: u32 = 101;
/// etcd v2 error code: key already exists.
pub(crate) const NODE_EXISTS: u32 = 105;
/// etcd v2 error code: the requested watch index has been compacted.
pub(crate) const EVENT_INDEX_CLEARED: u32 = 401;

/// Errors reported by a [`Store`](super::Store).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key does not exist.
    #[error("key '{key}' not found")]
    NotFound { key: String },

    /// A write precondition failed: the key exists on create, or the value
    /// did not match on compare-and-swap / compare-and-delete.
    ///
    /// `index` is the store index at the time of the failure and is used as
    /// a watch cursor by callers.
    #[error("condition failed on '{key}' at index {index}: {cause}")]
    ConditionFailed {
        key: String,
        cause: String,
        index: u64,
    },

    /// A watch asked for history the store no longer retains.
    #[error("watch index cleared, store is at index {index}")]
    IndexCleared { index: u64 },

    /// The store could not be reached.
    #[error("store unreachable: {0}")]
    Transport(String),

    /// The store answered with an error this facade does not interpret.
    #[error("store error {code}: {message}")]
    Server { code: u32, message: String },

    /// The store answered with something that is not a valid response.
    #[error("invalid store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// Build an error from an etcd v2 error body.
    pub(crate) fn from_etcd(code: u32, message: String, cause: Option<String>, index: u64) -> Self {
        let cause = cause.unwrap_or_default();
        match code {
            KEY_NOT_FOUND => StoreError::NotFound { key: cause },
            TEST_FAILED | NODE_EXISTS => StoreError::ConditionFailed {
                key: condition_key(&cause),
                cause: message,
                index,
            },
            EVENT_INDEX_CLEARED => StoreError::IndexCleared { index },
            _ => StoreError::Server { code, message },
        }
    }
}

/// etcd reports `[prevValue != value]` style causes for compare failures and
/// the key path for existence failures; keep the path when there is one.
fn condition_key(cause: &str) -> String {
    if cause.starts_with('/') {
        cause.to_string()
    } else {
        String::new()
    }
}
