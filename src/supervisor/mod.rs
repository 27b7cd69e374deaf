//! Runs a child process for exactly as long as a lock is held.
//!
//! # Session
//!
//! 1. Acquire the lock. Failure exits with 1.
//! 2. Register "release lock", spawn the child, register "terminate child".
//! 3. Optionally start the heartbeat prober.
//! 4. Wait for the first of: child exit, lock loss, heartbeat failure or a
//!    shutdown signal.
//! 5. Run cleanup once (child first, then the lock) and return the exit
//!    code for whatever ended the session, or 3 if the child could not be
//!    stopped.

mod child;
mod cleanup;
mod signals;


use child::{ChildProcess, ExitOutcome, exit_code_for};
use cleanup::CleanupStack;
use signals::{ShutdownSignals, signal_name};

use crate::config::Config;
use crate::error::{LockrunError, Result};
use crate::exit_codes;
use crate::heartbeat::{self, HeartbeatError, HeartbeatProber, ProbeHandle};
use crate::locks::Lock;
use crate::store::Store;
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a closed heartbeat channel waits for the child's exit status.
///
/// The child closing its end usually means it is exiting; its own code is
/// the better answer than a heartbeat failure.
const CHANNEL_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// One supervised run of the configured command.
pub struct Supervisor {
    config: Config,
    store: Arc<dyn Store>,
}

impl Supervisor {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    /// Run the session, ending early on SIGTERM, SIGINT or SIGQUIT.
    pub async fn run(self) -> i32 {
        let signals = match ShutdownSignals::install() {
            Ok(signals) => Some(signals),
            Err(err) => {
                warn!(error = %err, "failed to install signal handlers");
                None
            }
        };

        self.run_until(async move {
            match signals {
                Some(mut signals) => signals.recv().await,
                None => std::future::pending().await,
            }
        })
        .await
    }

    /// Run the session, treating `shutdown` resolving to signal `n` like
    /// receiving that signal.
    pub async fn run_until<F>(self, shutdown: F) -> i32
    where
        F: Future<Output = i32>,
    {
        tokio::pin!(shutdown);

        let lock = Arc::new(Lock::new(
            Arc::clone(&self.store),
            self.config.lock_options(),
        ));
        let mut cleanup = CleanupStack::new();

        let code = self.session(&lock, &mut cleanup, shutdown.as_mut()).await;
        let failures = cleanup.run().await;
        let code = final_exit_code(code, &failures);

        info!(exit_code = code, "exiting");
        code
    }

    async fn session<F>(
        &self,
        lock: &Arc<Lock>,
        cleanup: &mut CleanupStack,
        mut shutdown: Pin<&mut F>,
    ) -> i32
    where
        F: Future<Output = i32>,
    {
        let mut lost = lock.subscribe();

        info!(
            key = %self.config.key,
            owner = %self.config.owner,
            ttl = self.config.ttl,
            "acquiring lock"
        );
        tokio::select! {
            result = lock.lock() => {
                if let Err(err) = result {
                    error!(error = %err, "failed to acquire lock");
                    return exit_codes::ACQUIRE_FAILURE;
                }
            }
            signal = &mut shutdown => {
                warn!(signal = %signal_label(signal), "interrupted while acquiring lock");
                // A create may have landed before the request was dropped.
                let lock = Arc::clone(lock);
                cleanup.push("release lock", move || async move {
                    if let Err(err) = lock.unlock().await {
                        debug!(error = %err, "no lock to release");
                    }
                    Ok(())
                });
                return exit_codes::for_signal(signal);
            }
        }
        cleanup.push("release lock", release(lock));

        let (parent_end, child_end) = if self.config.heartbeat {
            match heartbeat::pair() {
                Ok((parent, child)) => (Some(parent), Some(child)),
                Err(err) => {
                    error!(error = %err, "failed to create heartbeat channel");
                    return exit_codes::HEARTBEAT_FAILURE;
                }
            }
        } else {
            (None, None)
        };

        let child = match ChildProcess::spawn(&self.config.command, child_end.as_ref()) {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, "failed to start command");
                return err.exit_code();
            }
        };
        // The child holds its own copy now.
        drop(child_end);

        let kill_timeout = self.config.kill_timeout();
        let terminated = child.clone();
        cleanup.push("terminate child", move || async move {
            terminated.terminate(kill_timeout).await
        });

        let mut probe = match parent_end {
            Some(channel) => {
                match HeartbeatProber::new(self.config.ping_interval(), self.config.max_wait()) {
                    Ok(prober) => Some(prober.start(channel)),
                    Err(err) => {
                        error!(error = %err, "invalid heartbeat timing");
                        return exit_codes::HEARTBEAT_FAILURE;
                    }
                }
            }
            None => None,
        };

        tokio::select! {
            outcome = child.wait() => child_exit_code(&child, outcome),
            notice = lost.recv() => {
                match notice {
                    Ok(notice) => error!(%notice, "lock lost, stopping command"),
                    Err(err) => error!(error = %err, "lock lost, stopping command"),
                }
                exit_codes::LOCK_LOST
            }
            err = probe_failure(&mut probe) => {
                if err == HeartbeatError::ChannelClosed
                    && let Ok(outcome) = tokio::time::timeout(CHANNEL_CLOSE_GRACE, child.wait()).await
                {
                    debug!("heartbeat channel closed by exiting child");
                    return child_exit_code(&child, outcome);
                }
                error!(error = %err, pid = child.pid(), "heartbeat failed, stopping command");
                exit_codes::HEARTBEAT_FAILURE
            }
            signal = &mut shutdown => {
                warn!(signal = %signal_label(signal), "received signal, shutting down");
                exit_codes::for_signal(signal)
            }
        }
    }
}

/// Cleanup action deleting the key if the lock is still ours.
fn release(lock: &Arc<Lock>) -> impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static {
    let lock = Arc::clone(lock);
    move || {
        Box::pin(async move {
            let state = lock.state();
            if state.is_terminal() {
                debug!(key = %lock.key(), %state, "lock no longer held, nothing to release");
                return Ok(());
            }
            lock.unlock().await
        })
    }
}

/// The session's exit code, unless stopping the child failed: a child that
/// may still be running outranks whatever ended the session.
fn final_exit_code(session_code: i32, cleanup_failures: &[LockrunError]) -> i32 {
    if cleanup_failures
        .iter()
        .any(|err| matches!(err, LockrunError::ChildProcess(_)))
    {
        error!(session_code, "failed to stop command");
        return exit_codes::CHILD_FAILURE;
    }
    session_code
}

async fn probe_failure(probe: &mut Option<ProbeHandle>) -> HeartbeatError {
    match probe {
        Some(handle) => handle.failed().await,
        None => std::future::pending().await,
    }
}

fn child_exit_code(child: &ChildProcess, outcome: ExitOutcome) -> i32 {
    match outcome {
        Ok(status) => {
            let code = exit_code_for(&status);
            info!(pid = child.pid(), code, "command exited");
            code
        }
        Err(err) => {
            error!(pid = child.pid(), error = %err, "failed to wait for command");
            exit_codes::CHILD_FAILURE
        }
    }
}

fn signal_label(signal: i32) -> String {
    signal_name(signal).unwrap_or_else(|| signal.to_string())
}
