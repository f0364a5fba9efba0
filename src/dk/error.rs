use std::io;
use std::path::PathBuf;

/// Failures surfaced by the daemon control plane.
///
/// Worker hook failures are deliberately absent: `stop()`/`restart()` errors are
/// reported and swallowed by the controller so cleanup always completes.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Another live instance holds the advisory lock on the pid file.
    #[error("service already running: pid file {} is locked by another process", path.display())]
    LockConflict { path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("spawn program={} failed: kind={:?} os_error={:?} err={source}", program.display(), source.kind(), source.raw_os_error())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("service not running: pid file {} does not exist", path.display())]
    NotRunning { path: PathBuf },

    #[error("pid file {} does not contain a process id: {content:?}", path.display())]
    InvalidPid { path: PathBuf, content: String },

    #[error("deliver signal {signal} to pid {pid} failed: {reason}")]
    Signal { pid: i32, signal: String, reason: String },

    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("service {0:?} is already registered")]
    DuplicateService(String),
}

impl DaemonError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        DaemonError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, DaemonError::LockConflict { .. })
    }
}
