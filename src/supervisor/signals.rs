//! Signal names, delivery, and the supervisor's own termination signals.

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::debug;

/// Signals lockrun knows by name.
static SIGNALS: &[(&str, i32)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("ILL", libc::SIGILL),
    ("ABRT", libc::SIGABRT),
    ("FPE", libc::SIGFPE),
    ("KILL", libc::SIGKILL),
    ("SEGV", libc::SIGSEGV),
    ("PIPE", libc::SIGPIPE),
    ("ALRM", libc::SIGALRM),
    ("TERM", libc::SIGTERM),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
];

/// Signals that make the supervisor clean up and exit.
const SHUTDOWN_SIGNALS: [&str; 3] = ["TERM", "INT", "QUIT"];

/// Look up a signal number by name, with or without the `SIG` prefix.
pub fn signal_number(name: &str) -> Option<i32> {
    let upper = name.trim().to_ascii_uppercase();
    let short = upper.strip_prefix("SIG").unwrap_or(&upper);
    SIGNALS
        .iter()
        .find(|(known, _)| *known == short)
        .map(|(_, number)| *number)
}

/// `SIG`-prefixed name of a known signal number.
pub fn signal_name(number: i32) -> Option<String> {
    SIGNALS
        .iter()
        .find(|(_, known)| *known == number)
        .map(|(name, _)| format!("SIG{}", name))
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: u32, signal: i32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Listeners for SIGTERM, SIGINT and SIGQUIT.
pub struct ShutdownSignals {
    listeners: Vec<(i32, Signal)>,
}

impl ShutdownSignals {
    /// Install handlers. From here on these signals no longer kill the
    /// process; they are delivered to [`ShutdownSignals::recv`].
    pub fn install() -> std::io::Result<Self> {
        let mut listeners = Vec::with_capacity(SHUTDOWN_SIGNALS.len());
        for name in SHUTDOWN_SIGNALS {
            if let Some(number) = signal_number(name) {
                listeners.push((number, signal(SignalKind::from_raw(number))?));
            }
        }
        debug!("shutdown signal handlers installed");
        Ok(Self { listeners })
    }

    /// Wait for the next shutdown signal and return its number.
    pub async fn recv(&mut self) -> i32 {
        if self.listeners.is_empty() {
            return std::future::pending().await;
        }
        let waits = self.listeners.iter_mut().map(|(number, listener)| {
            let number = *number;
            Box::pin(async move {
                listener.recv().await;
                number
            })
        });
        let (number, _, _) = futures::future::select_all(waits).await;
        number
    }
}
