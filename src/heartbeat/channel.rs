//! Ping/pong transport between supervisor and child.
//!
//! Messages are newline-delimited JSON objects on a Unix socket pair. The
//! child's end is inherited across exec; its descriptor number is exported
//! in [`CHANNEL_FD_ENV`].

use super::HeartbeatError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Environment variable naming the child's channel descriptor.
pub const CHANNEL_FD_ENV: &str = "LOCKRUN_CHANNEL_FD";

#[derive(Debug, Serialize)]
struct Ping {
    ping: u64,
}

#[derive(Debug, Deserialize)]
struct Pong {
    pong: u64,
}

/// Supervisor side of the heartbeat conversation.
#[async_trait]
pub trait HeartbeatChannel: Send {
    async fn send_ping(&mut self, nonce: u64) -> Result<(), HeartbeatError>;

    /// Next reply nonce. Must be cancel-safe: dropping the future loses no
    /// reply.
    async fn recv_pong(&mut self) -> Result<u64, HeartbeatError>;
}

/// [`HeartbeatChannel`] over the supervisor's end of a socket pair.
///
/// A reader task parses replies as they arrive so `recv_pong` only waits on
/// a queue.
#[derive(Debug)]
pub struct UnixChannel {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<Result<u64, HeartbeatError>>,
    reader: JoinHandle<()>,
}

impl UnixChannel {
    pub fn new(stream: UnixStream) -> Self {
        let (read_half, writer) = stream.into_split();
        let (tx, replies) = mpsc::channel(16);
        Self {
            writer,
            replies,
            reader: tokio::spawn(read_replies(read_half, tx)),
        }
    }
}

impl Drop for UnixChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl HeartbeatChannel for UnixChannel {
    async fn send_ping(&mut self, nonce: u64) -> Result<(), HeartbeatError> {
        let line = encode_ping(nonce)?;
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| HeartbeatError::Io(e.to_string()))
    }

    async fn recv_pong(&mut self) -> Result<u64, HeartbeatError> {
        self.replies
            .recv()
            .await
            .unwrap_or(Err(HeartbeatError::ChannelClosed))
    }
}

/// Forward parsed replies until the stream ends or fails.
async fn read_replies(read_half: OwnedReadHalf, tx: mpsc::Sender<Result<u64, HeartbeatError>>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let reply = match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                trace!(%line, "heartbeat reply");
                parse_pong(&line)
            }
            Ok(None) => Err(HeartbeatError::ChannelClosed),
            Err(e) => Err(HeartbeatError::Io(e.to_string())),
        };
        let finished = reply.is_err();
        if tx.send(reply).await.is_err() || finished {
            return;
        }
    }
}

fn encode_ping(nonce: u64) -> Result<Vec<u8>, HeartbeatError> {
    let mut line =
        serde_json::to_vec(&Ping { ping: nonce }).map_err(|e| HeartbeatError::Io(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

fn parse_pong(line: &str) -> Result<u64, HeartbeatError> {
    serde_json::from_str::<Pong>(line)
        .map(|pong| pong.pong)
        .map_err(|e| HeartbeatError::Malformed(format!("{} in {:?}", e, line.trim())))
}

/// The child's end of the channel, kept open until the child is spawned.
#[derive(Debug)]
pub struct ChildEnd {
    stream: std::os::unix::net::UnixStream,
}

impl ChildEnd {
    /// Descriptor number to export to the child.
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Clear close-on-exec so the descriptor survives into the child.
    fn inherit_across_exec(&self) -> std::io::Result<()> {
        let fd = self.raw_fd();
        // SAFETY: `fd` is owned by `self.stream` and open for this call.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: as above; only the descriptor flags change.
        let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
        if result < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn into_std(self) -> std::os::unix::net::UnixStream {
        self.stream
    }
}

/// Create a connected channel: the supervisor side and the end to pass to
/// the child.
pub fn pair() -> std::io::Result<(UnixChannel, ChildEnd)> {
    let (parent, child) = std::os::unix::net::UnixStream::pair()?;
    parent.set_nonblocking(true)?;
    let parent = UnixStream::from_std(parent)?;

    let child = ChildEnd { stream: child };
    child.inherit_across_exec()?;
    Ok((UnixChannel::new(parent), child))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ping_as_json_line() {
        let line = encode_ping(42).unwrap();
        assert_eq!(line, b"{\"ping\":42}\n");
    }

    #[test]
    fn parses_pong() {
        assert_eq!(parse_pong(r#"{"pong": 7}"#).unwrap(), 7);
        assert_eq!(parse_pong(r#"{"pong":9007199254740991}"#).unwrap(), 9007199254740991);
    }

    #[test]
    fn rejects_malformed_pong() {
        assert!(matches!(
            parse_pong(r#"{"ping": 7}"#),
            Err(HeartbeatError::Malformed(_))
        ));
        assert!(matches!(
            parse_pong("pong"),
            Err(HeartbeatError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn child_end_survives_exec() {
        let (_channel, child) = pair().unwrap();
        // SAFETY: the descriptor is owned by `child` for this call.
        let flags = unsafe { libc::fcntl(child.raw_fd(), libc::F_GETFD) };
        assert!(flags >= 0);
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
    }
}
