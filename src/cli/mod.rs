//! CLI argument parsing for lockrun.
//!
//! Uses clap derive macros. Every option is optional at this layer; the
//! resolved [`crate::config::Config`] decides what is required once the
//! config file, environment and flags have been merged.

use clap::Parser;
use std::path::PathBuf;

/// Run a command while holding a distributed lock in etcd.
///
/// The lock is acquired before the command starts and held (refreshed
/// every half TTL) for as long as it runs. If the lock is lost, the
/// command is terminated.
#[derive(Parser, Debug, Default)]
#[command(name = "lockrun")]
#[command(author, version, about, long_about = None)]
#[command(override_usage = "lockrun [OPTIONS] [--] <COMMAND> [ARGS]...")]
pub struct Cli {
    /// Lease length in seconds.
    #[arg(short = 't', long, env = "LOCKRUN_TTL", value_name = "SECS")]
    pub ttl: Option<u64>,

    /// Refresh interval in seconds (default: half the TTL).
    #[arg(short = 'r', long, env = "LOCKRUN_REFRESH", value_name = "SECS")]
    pub refresh: Option<u64>,

    /// etcd endpoint as host:port or URL (default: localhost:2379).
    #[arg(short = 'e', long, env = "LOCKRUN_ENDPOINT", value_name = "HOST:PORT")]
    pub endpoint: Option<String>,

    /// Key to lock.
    #[arg(short = 'k', long, env = "LOCKRUN_KEY")]
    pub key: Option<String>,

    /// Owner id written to the key (default: host name).
    #[arg(short = 'o', long, env = "LOCKRUN_OWNER", value_name = "ID")]
    pub owner: Option<String>,

    /// Log lock and process lifecycle at debug level.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Probe the command with ping/pong messages over an inherited socket.
    #[arg(long)]
    pub heartbeat: bool,

    /// Delay between heartbeat rounds (default: 1000).
    #[arg(long, value_name = "MS")]
    pub ping_interval_ms: Option<u64>,

    /// Time allowed for a pong reply (default: 5000).
    #[arg(long, value_name = "MS")]
    pub max_wait_ms: Option<u64>,

    /// Seconds between SIGTERM and SIGKILL when stopping the command (default: 30).
    #[arg(long, value_name = "SECS")]
    pub kill_timeout: Option<u64>,

    /// Timeout for store requests other than watches (default: 10000).
    #[arg(long, value_name = "MS")]
    pub request_timeout_ms: Option<u64>,

    /// YAML file supplying defaults for the options above.
    #[arg(short = 'c', long, env = "LOCKRUN_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Command to run, followed by its arguments.
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}
