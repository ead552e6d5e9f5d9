use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::DaemonError;
use crate::store::state_file::StateFile;

/// Probes `pid` with signal 0. A process we may not signal still exists.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Singleton guard over the daemon PID file.
///
/// The file holds the decimal PID followed by a newline. A file naming a dead
/// process is stale: it is deleted on sight and the daemon counts as stopped.
#[derive(Debug)]
pub struct PidGuard {
    file: StateFile,
    held: bool,
}

impl PidGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: StateFile::new(path),
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Raw PID recorded in the file, if any parses.
    pub fn recorded_pid(&self) -> io::Result<Option<i32>> {
        let Some(raw) = self.file.read()? else {
            return Ok(None);
        };
        match raw.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!(path = %self.path().display(), "pid file does not hold a pid");
                Ok(None)
            }
        }
    }

    /// PID of the live daemon. Removes the file when it is stale or garbled.
    pub fn running_pid(&self) -> io::Result<Option<i32>> {
        if !self.file.exists() {
            return Ok(None);
        }
        match self.recorded_pid()? {
            Some(pid) if is_alive(pid) => Ok(Some(pid)),
            stale => {
                if let Some(pid) = stale {
                    warn!(pid, path = %self.path().display(), "removing stale pid file");
                }
                self.file.remove()?;
                Ok(None)
            }
        }
    }

    /// Records the current process as the daemon.
    pub fn acquire(&mut self) -> Result<(), DaemonError> {
        let own = std::process::id();
        if let Some(pid) = self.running_pid().map_err(|source| self.io_error(source))? {
            if u32::try_from(pid).ok() != Some(own) {
                return Err(DaemonError::AlreadyRunning(pid));
            }
        }
        self.file
            .replace(&format!("{own}\n"))
            .map_err(|source| self.io_error(source))?;
        self.held = true;
        debug!(pid = own, path = %self.path().display(), "pid file written");
        Ok(())
    }

    /// Deletes the file if it still names this process.
    pub fn release(&mut self) -> Result<(), DaemonError> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        let own = i32::try_from(std::process::id()).ok();
        let recorded = self.recorded_pid().map_err(|source| self.io_error(source))?;
        if recorded.is_some() && recorded != own {
            warn!(path = %self.path().display(), "pid file was taken over, leaving it");
            return Ok(());
        }
        self.file
            .remove()
            .map(|_| ())
            .map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: io::Error) -> DaemonError {
        DaemonError::PidFile {
            path: self.path().to_path_buf(),
            source,
        }
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if self.held {
            let _ = self.release();
        }
    }
}
