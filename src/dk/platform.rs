//! Signal identities, advisory file locks, and signal delivery.
//!
//! POSIX builds map [`SignalId::STOP`]/[`SignalId::RESTART`] onto `SIGUSR1`/`SIGUSR2`
//! and use `flock(2)` for the pid-file lock. Other platforms get inert stand-ins:
//! the lock always succeeds (the single-instance guarantee is NOT enforced there) and
//! signals can only be raised from inside the process with [`raise_local`].

use crate::dk::error::DaemonError;
use std::fmt;
use std::fs::File;
use std::io;

/// Opaque, comparable signal identity used as the dispatch-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(i32);

#[cfg(unix)]
impl SignalId {
    pub const STOP: SignalId = SignalId(libc::SIGUSR1);
    pub const RESTART: SignalId = SignalId(libc::SIGUSR2);
}

#[cfg(not(unix))]
impl SignalId {
    pub const STOP: SignalId = SignalId(0x1e);
    pub const RESTART: SignalId = SignalId(0x1f);
}

impl SignalId {
    pub const fn from_raw(raw: i32) -> SignalId {
        SignalId(raw)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        SIGNAL_NAMES
            .iter()
            .find(|(_, raw)| *raw == self.0)
            .map(|(name, _)| *name)
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "SIG{name}"),
            None => write!(f, "SIG#{}", self.0),
        }
    }
}

#[cfg(unix)]
const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("TERM", libc::SIGTERM),
    ("KILL", libc::SIGKILL),
    ("INT", libc::SIGINT),
    ("HUP", libc::SIGHUP),
    ("QUIT", libc::SIGQUIT),
    ("ABRT", libc::SIGABRT),
    ("ALRM", libc::SIGALRM),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("CHLD", libc::SIGCHLD),
    ("WINCH", libc::SIGWINCH),
];

#[cfg(not(unix))]
const SIGNAL_NAMES: &[(&str, i32)] = &[("USR1", 0x1e), ("USR2", 0x1f)];

/// Parse `USR1`, `SIGUSR1`, `usr1` or a raw signal number.
pub fn parse_signal(s: &str) -> Result<SignalId, DaemonError> {
    let raw = s.trim().to_uppercase();
    if let Ok(n) = raw.parse::<i32>() {
        if n > 0 {
            return Ok(SignalId(n));
        }
    }
    let name = raw.strip_prefix("SIG").unwrap_or(&raw);
    SIGNAL_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, raw)| SignalId(*raw))
        .ok_or_else(|| DaemonError::Config(format!("unsupported signal: {s}")))
}

/// Non-blocking exclusive advisory lock on `file`.
///
/// Fails with [`io::ErrorKind::WouldBlock`] when another open file description
/// (in this or any other process) already holds the lock. The lock lives as long
/// as `file` stays open.
#[cfg(unix)]
pub fn try_exclusive_lock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file`, which outlives this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// No advisory locks here: always succeeds, so two instances of one service can coexist.
#[cfg(not(unix))]
pub fn try_exclusive_lock(_file: &File) -> io::Result<()> {
    Ok(())
}

/// Deliver `signal` to process `pid`.
#[cfg(unix)]
pub fn send_signal(pid: i32, signal: SignalId) -> Result<(), DaemonError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sig = Signal::try_from(signal.as_raw()).map_err(|e| DaemonError::Signal {
        pid,
        signal: signal.to_string(),
        reason: e.to_string(),
    })?;
    kill(Pid::from_raw(pid), sig).map_err(|e| DaemonError::Signal {
        pid,
        signal: signal.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
pub fn send_signal(_pid: i32, _signal: SignalId) -> Result<(), DaemonError> {
    Err(DaemonError::Unsupported("cross-process signal delivery"))
}

/// True if a process with this id exists (signal 0 probe).
#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
pub fn process_alive(_pid: i32) -> bool {
    false
}

/// Blocking source of received signals for the dispatch loop.
#[cfg(unix)]
pub(crate) struct SignalListener {
    signals: signal_hook::iterator::Signals,
}

#[cfg(unix)]
impl SignalListener {
    /// Route the given identities to this listener. Everything else keeps the OS default.
    pub(crate) fn install<I>(ids: I) -> Result<SignalListener, DaemonError>
    where
        I: IntoIterator<Item = SignalId>,
    {
        let raw: Vec<i32> = ids.into_iter().map(SignalId::as_raw).collect();
        let signals = signal_hook::iterator::Signals::new(&raw)
            .map_err(|e| DaemonError::io(format!("register signal handlers {raw:?}"), e))?;
        Ok(SignalListener { signals })
    }

    pub(crate) fn forever(&mut self) -> impl Iterator<Item = SignalId> + '_ {
        self.signals.forever().map(SignalId::from_raw)
    }
}

#[cfg(not(unix))]
mod local {
    use super::SignalId;
    use std::sync::mpsc::Sender;
    use std::sync::{Mutex, OnceLock};

    pub(super) static LOCAL_TX: OnceLock<Mutex<Option<Sender<SignalId>>>> = OnceLock::new();

    pub(super) fn slot() -> &'static Mutex<Option<Sender<SignalId>>> {
        LOCAL_TX.get_or_init(|| Mutex::new(None))
    }
}

#[cfg(not(unix))]
pub(crate) struct SignalListener {
    rx: std::sync::mpsc::Receiver<SignalId>,
}

#[cfg(not(unix))]
impl SignalListener {
    pub(crate) fn install<I>(_ids: I) -> Result<SignalListener, DaemonError>
    where
        I: IntoIterator<Item = SignalId>,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        *local::slot().lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        Ok(SignalListener { rx })
    }

    pub(crate) fn forever(&mut self) -> impl Iterator<Item = SignalId> + '_ {
        self.rx.iter()
    }
}

/// Inject a signal identity into this process's dispatch loop.
#[cfg(not(unix))]
pub fn raise_local(signal: SignalId) -> Result<(), DaemonError> {
    let guard = local::slot().lock().unwrap_or_else(|p| p.into_inner());
    match guard.as_ref() {
        Some(tx) => tx
            .send(signal)
            .map_err(|_| DaemonError::Unsupported("dispatch loop is gone")),
        None => Err(DaemonError::Unsupported("no dispatch loop running")),
    }
}
