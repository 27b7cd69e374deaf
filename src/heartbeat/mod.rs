//! Liveness probing of the supervised child.
//!
//! The prober sends `{"ping": n}` with a fresh random nonce and expects
//! `{"pong": n}` back within `max_wait`. After a matching reply it idles for
//! `ping_interval` and starts the next round. At most one round is
//! outstanding; a reply outside a round, a reply with the wrong nonce, a
//! missed deadline or a closed channel stops probing with an error.

mod channel;


pub use channel::{CHANNEL_FD_ENV, ChildEnd, HeartbeatChannel, pair};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Largest nonce sent; keeps values exact for JSON readers using doubles.
const MAX_NONCE: u64 = (1 << 53) - 1;

/// Reasons probing stops.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("ping interval ({ping_interval_ms}ms) must be shorter than max wait ({max_wait_ms}ms)")]
    InvalidTiming {
        ping_interval_ms: u64,
        max_wait_ms: u64,
    },

    #[error("no reply to ping {nonce} before the deadline")]
    Timeout { nonce: u64 },

    #[error("reply carried nonce {received}, expected {expected}")]
    NonceMismatch { expected: u64, received: u64 },

    #[error("unexpected reply {nonce} while no ping was outstanding")]
    UnexpectedReply { nonce: u64 },

    #[error("channel closed by the child")]
    ChannelClosed,

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("channel I/O failed: {0}")]
    Io(String),

    #[error("probe task aborted")]
    Aborted,
}

/// Heartbeat timing, checked at construction.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatProber {
    ping_interval: Duration,
    max_wait: Duration,
}

impl HeartbeatProber {
    /// Fails unless `ping_interval < max_wait`.
    pub fn new(ping_interval: Duration, max_wait: Duration) -> Result<Self, HeartbeatError> {
        if ping_interval >= max_wait {
            return Err(HeartbeatError::InvalidTiming {
                ping_interval_ms: ping_interval.as_millis() as u64,
                max_wait_ms: max_wait.as_millis() as u64,
            });
        }
        Ok(Self {
            ping_interval,
            max_wait,
        })
    }

    /// Start probing over `channel`. The first ping goes out immediately.
    pub fn start<C>(&self, channel: C) -> ProbeHandle
    where
        C: HeartbeatChannel + 'static,
    {
        debug!(
            ping_interval_ms = self.ping_interval.as_millis() as u64,
            max_wait_ms = self.max_wait.as_millis() as u64,
            "starting heartbeat"
        );
        ProbeHandle {
            task: tokio::spawn(probe(channel, self.ping_interval, self.max_wait)),
            outcome: None,
        }
    }
}

/// A running probe. Dropping it stops probing.
#[derive(Debug)]
pub struct ProbeHandle {
    task: JoinHandle<HeartbeatError>,
    outcome: Option<HeartbeatError>,
}

impl ProbeHandle {
    /// Resolves with the error that stopped probing.
    ///
    /// Cancel-safe, and returns the same error if awaited again.
    pub async fn failed(&mut self) -> HeartbeatError {
        if let Some(err) = &self.outcome {
            return err.clone();
        }
        let err = (&mut self.task)
            .await
            .unwrap_or(HeartbeatError::Aborted);
        self.outcome = Some(err.clone());
        err
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn probe<C: HeartbeatChannel>(
    mut channel: C,
    ping_interval: Duration,
    max_wait: Duration,
) -> HeartbeatError {
    let mut rng = StdRng::from_entropy();

    loop {
        let nonce = rng.gen_range(1..=MAX_NONCE);
        if let Err(err) = channel.send_ping(nonce).await {
            return err;
        }
        trace!(nonce, "ping sent");

        match tokio::time::timeout(max_wait, channel.recv_pong()).await {
            Err(_) => return HeartbeatError::Timeout { nonce },
            Ok(Err(err)) => return err,
            Ok(Ok(received)) if received != nonce => {
                return HeartbeatError::NonceMismatch {
                    expected: nonce,
                    received,
                };
            }
            Ok(Ok(_)) => trace!(nonce, "pong received"),
        }

        // Idle between rounds; nothing may arrive here.
        match tokio::time::timeout(ping_interval, channel.recv_pong()).await {
            Err(_) => {}
            Ok(Err(err)) => return err,
            Ok(Ok(received)) => return HeartbeatError::UnexpectedReply { nonce: received },
        }
    }
}
