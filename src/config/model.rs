//! Config struct definition and default implementation.

use serde::{Deserialize, Serialize};

/// Resolved settings for one supervised run.
///
/// A config file supplies defaults, flags and environment variables
/// override them. Unknown fields in the YAML are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // =========================================================================
    // Lock settings
    // =========================================================================
    /// Lease length in seconds. Required; zero means unset.
    pub ttl: u64,

    /// Refresh interval in seconds. Half the TTL when unset.
    pub refresh: Option<u64>,

    /// etcd endpoint, `host:port` or a URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Key to lock. Required.
    pub key: String,

    /// Value written to the key while held.
    #[serde(default = "default_owner")]
    pub owner: String,

    /// Timeout for store requests other than watches.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    // =========================================================================
    // Process settings
    // =========================================================================
    /// Seconds to wait after SIGTERM before sending SIGKILL.
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,

    /// Command line of the supervised process.
    pub command: Vec<String>,

    // =========================================================================
    // Heartbeat settings
    // =========================================================================
    /// Whether to probe the child over the IPC channel.
    pub heartbeat: bool,

    /// Delay between the end of one probe round and the next ping.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Time allowed for a matching pong.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_endpoint() -> String {
    "localhost:2379".to_string()
}

/// The host name, or empty if it is not valid UTF-8.
fn default_owner() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_kill_timeout_secs() -> u64 {
    30
}

fn default_ping_interval_ms() -> u64 {
    1000
}

fn default_max_wait_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl: 0,
            refresh: None,
            endpoint: default_endpoint(),
            key: String::new(),
            owner: default_owner(),
            request_timeout_ms: default_request_timeout_ms(),
            kill_timeout_secs: default_kill_timeout_secs(),
            command: Vec::new(),
            heartbeat: false,
            ping_interval_ms: default_ping_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}
