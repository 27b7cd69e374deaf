//! Store data types: nodes, events and write preconditions.

use serde::{Deserialize, Serialize};

/// A key as stored, at a particular modification index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Full key path.
    pub key: String,

    /// Current value. Absent on delete/expire events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Remaining time to live in seconds, if the key has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,

    /// Index of the write that produced this node.
    pub modified_index: u64,

    /// Index of the write that created the key.
    #[serde(default)]
    pub created_index: u64,
}

impl Node {
    /// Whether the stored value is exactly `owner`.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.value.as_deref() == Some(owner)
    }
}

/// The kind of write an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreAction {
    Get,
    Create,
    Set,
    Update,
    CompareAndSwap,
    Delete,
    Expire,
    CompareAndDelete,
}

impl StoreAction {
    /// Whether this action frees the key (delete, expire, compare-and-delete).
    pub fn is_release(&self) -> bool {
        matches!(
            self,
            StoreAction::Delete | StoreAction::Expire | StoreAction::CompareAndDelete
        )
    }

    /// Whether this action is an unconditional overwrite.
    pub fn is_overwrite(&self) -> bool {
        matches!(self, StoreAction::Set)
    }
}

impl std::fmt::Display for StoreAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StoreAction::Get => "get",
            StoreAction::Create => "create",
            StoreAction::Set => "set",
            StoreAction::Update => "update",
            StoreAction::CompareAndSwap => "compareAndSwap",
            StoreAction::Delete => "delete",
            StoreAction::Expire => "expire",
            StoreAction::CompareAndDelete => "compareAndDelete",
        };
        write!(f, "{}", name)
    }
}

/// A change to a key, as delivered by a watch or returned by a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEvent {
    pub action: StoreAction,
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<Node>,
}

impl StoreEvent {
    /// The value after the change, if the key still exists.
    pub fn value(&self) -> Option<&str> {
        if self.action.is_release() {
            None
        } else {
            self.node.value.as_deref()
        }
    }

    /// Index of the write this event reports.
    pub fn index(&self) -> u64 {
        self.node.modified_index
    }
}

/// Preconditions and lease for a conditional write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Lease in whole seconds.
    pub ttl: Option<u64>,

    /// Require the key to exist (`true`) or not exist (`false`).
    pub prev_exist: Option<bool>,

    /// Require the current value to equal this.
    pub prev_value: Option<String>,
}

impl SetOptions {
    /// Create the key with a lease, failing if it already exists.
    pub fn create(ttl: u64) -> Self {
        Self {
            ttl: Some(ttl),
            prev_exist: Some(false),
            prev_value: None,
        }
    }

    /// Rewrite the key with a fresh lease, failing unless it currently holds
    /// `prev_value`.
    pub fn swap(ttl: u64, prev_value: &str) -> Self {
        Self {
            ttl: Some(ttl),
            prev_exist: None,
            prev_value: Some(prev_value.to_string()),
        }
    }
}
