//! On-disk pid marker for one named service instance.
//!
//! The file `<save_path>/<service>.pid` holds the owner's process id as decimal text and
//! carries an exclusive advisory lock for as long as the owner keeps it open. The lock,
//! not the file's existence, is what makes an instance "running": a file left behind by a
//! crashed daemon is stale and gets taken over by the next `save()`.

use crate::dk::error::DaemonError;
use crate::dk::platform::try_exclusive_lock;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct PidRecord {
    service_name: String,
    save_path: PathBuf,
    pid: Option<i32>,
    file: Option<File>,
}

impl PidRecord {
    /// `save_path` is resolved against the current directory once, here.
    pub fn new(service_name: impl Into<String>, save_path: impl AsRef<Path>) -> Result<PidRecord, DaemonError> {
        let save_path = save_path.as_ref();
        let save_path = std::path::absolute(save_path)
            .map_err(|e| DaemonError::io(format!("resolve pid directory {}", save_path.display()), e))?;
        Ok(PidRecord {
            service_name: service_name.into(),
            save_path,
            pid: None,
            file: None,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Pid written by the last successful `save()`.
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// True while this record holds the lock.
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub fn save_filename(&self) -> PathBuf {
        self.save_path.join(format!("{}.pid", self.service_name))
    }

    /// Create/lock the pid file and write `pid` into it.
    ///
    /// The file is opened without truncation and only rewritten once the lock is ours, so a
    /// losing contender never clobbers the owner's content.
    pub fn save(&mut self, pid: i32) -> Result<(), DaemonError> {
        let path = self.save_filename();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DaemonError::io(format!("create pid directory {}", parent.display()), e))?;
        }

        // Re-saving replaces our own handle; keeping it would conflict with the new one.
        self.file = None;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| DaemonError::io(format!("open pid file {}", path.display()), e))?;

        claim(&file, &path)?;

        file.set_len(0)
            .and_then(|_| file.write_all(pid.to_string().as_bytes()))
            .and_then(|_| file.flush())
            .map_err(|e| DaemonError::io(format!("write pid file {}", path.display()), e))?;

        self.pid = Some(pid);
        self.file = Some(file);
        Ok(())
    }

    /// Delete the pid file and release the lock. Best-effort and idempotent.
    ///
    /// Only a record that holds the lock touches the file: a path we never locked may
    /// belong to another live instance.
    pub fn remove(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // A contender that opened the path before the unlink can still lock the old
        // inode once we close it; `claim` rejects that lock because the path has moved on.
        let _ = fs::remove_file(self.save_filename());
        drop(file);
    }
}

/// Lock `file` and make sure it is still the file linked at `path`.
///
/// Opening and locking are two steps: an owner may unlink the file in between, leaving
/// us a lock on an inode nobody can find. That counts as a conflict, not ownership.
fn claim(file: &File, path: &Path) -> Result<(), DaemonError> {
    match try_exclusive_lock(file) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            return Err(DaemonError::LockConflict { path: path.to_path_buf() });
        }
        Err(e) => return Err(DaemonError::io(format!("lock pid file {}", path.display()), e)),
    }
    let linked = still_linked(file, path)
        .map_err(|e| DaemonError::io(format!("stat pid file {}", path.display()), e))?;
    if !linked {
        return Err(DaemonError::LockConflict { path: path.to_path_buf() });
    }
    Ok(())
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}

/// What an external reader finds at a pid file path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instance {
    Absent,
    Running { pid: i32 },
    /// File exists but nobody holds the lock (owner crashed or was killed).
    Stale { pid: i32 },
}

/// Read the decimal pid from `path`.
pub fn read_pid(path: &Path) -> Result<i32, DaemonError> {
    let body = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DaemonError::NotRunning { path: path.to_path_buf() });
        }
        Err(e) => return Err(DaemonError::io(format!("read pid file {}", path.display()), e)),
    };
    body.trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| DaemonError::InvalidPid {
            path: path.to_path_buf(),
            content: body.clone(),
        })
}

/// Classify the instance behind `path` by testing its lock.
///
/// The probe holds the lock for an instant when the file is stale; a daemon starting at
/// exactly that moment may see a conflict.
pub fn probe(path: &Path) -> Result<Instance, DaemonError> {
    let pid = match read_pid(path) {
        Ok(pid) => pid,
        Err(DaemonError::NotRunning { .. }) => return Ok(Instance::Absent),
        Err(e) => return Err(e),
    };
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Instance::Absent),
        Err(e) => return Err(DaemonError::io(format!("open pid file {}", path.display()), e)),
    };
    match try_exclusive_lock(&file) {
        Ok(()) => Ok(Instance::Stale { pid }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Instance::Running { pid }),
        Err(e) => Err(DaemonError::io(format!("lock pid file {}", path.display()), e)),
    }
}
