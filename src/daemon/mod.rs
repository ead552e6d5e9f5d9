//! Background ingestion daemon.
//!
//! `start` launches `pruneguard watch --foreground` detached, which then
//! runs [`run_foreground`] until SIGTERM or SIGINT. The PID file is the only
//! coordination point between the CLI and the daemon.

pub mod pidfile;

use std::ffi::OsString;
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Settings;
use crate::ingest::LogProcessor;
use crate::store::SqliteStore;

pub use pidfile::{PidGuard, is_alive};

pub const START_TIMEOUT: Duration = Duration::from_secs(5);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon already running with pid {0}")]
    AlreadyRunning(i32),
    #[error("pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot open daemon log {path}: {source}")]
    DaemonLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("daemon exited during startup ({status}); see {log}")]
    ExitedEarly { status: String, log: PathBuf },
    #[error("daemon did not publish a live pid within {}s; see {log}", .waited.as_secs())]
    StartTimeout { waited: Duration, log: PathBuf },
    #[error("cannot signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: Errno,
    },
    #[error("pid {pid} still alive {}s after SIGTERM", .waited.as_secs())]
    StopTimeout { pid: i32, waited: Duration },
    #[error("cannot install signal handler: {0}")]
    Handler(#[from] ctrlc::Error),
    #[error("cannot prepare state directory {path}: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot open store: {0}")]
    Store(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(i32),
    AlreadyRunning(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(i32),
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub pid_file: PathBuf,
    pub log: PathBuf,
}

pub fn status(settings: &Settings) -> Result<DaemonStatus, DaemonError> {
    let guard = PidGuard::new(&settings.pid_file);
    let pid = guard.running_pid().map_err(|source| DaemonError::PidFile {
        path: settings.pid_file.clone(),
        source,
    })?;
    Ok(DaemonStatus {
        running: pid.is_some(),
        pid,
        pid_file: settings.pid_file.clone(),
        log: settings.daemon_log.clone(),
    })
}

/// Spawns `program args...` in its own process group with stdin closed and
/// both output streams appended to the daemon log, then waits for it to
/// publish a live PID.
pub fn start(
    settings: &Settings,
    program: &Path,
    args: &[OsString],
) -> Result<StartOutcome, DaemonError> {
    if let Some(pid) = status(settings)?.pid {
        info!(pid, "daemon already running");
        return Ok(StartOutcome::AlreadyRunning(pid));
    }

    let log = &settings.daemon_log;
    if let Some(parent) = log.parent() {
        fs::create_dir_all(parent).map_err(|source| DaemonError::StateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .map_err(|source| DaemonError::DaemonLog {
            path: log.clone(),
            source,
        })?;
    let stderr = stdout.try_clone().map_err(|source| DaemonError::DaemonLog {
        path: log.clone(),
        source,
    })?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()
        .map_err(|source| DaemonError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

    let guard = PidGuard::new(&settings.pid_file);
    let deadline = Instant::now() + START_TIMEOUT;
    loop {
        if let Ok(Some(exit)) = child.try_wait() {
            return Err(DaemonError::ExitedEarly {
                status: exit.to_string(),
                log: log.clone(),
            });
        }
        if let Ok(Some(pid)) = guard.recorded_pid()
            && is_alive(pid)
        {
            info!(pid, log = %log.display(), "daemon started");
            return Ok(StartOutcome::Started(pid));
        }
        if Instant::now() >= deadline {
            return Err(DaemonError::StartTimeout {
                waited: START_TIMEOUT,
                log: log.clone(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Sends SIGTERM and waits for the daemon to go away. The daemon deletes its
/// PID file as the last step of shutdown, so a vanished file also counts.
pub fn stop(settings: &Settings) -> Result<StopOutcome, DaemonError> {
    let Some(pid) = status(settings)?.pid else {
        return Ok(StopOutcome::NotRunning);
    };

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(StopOutcome::Stopped(pid)),
        Err(source) => return Err(DaemonError::Signal { pid, source }),
    }
    info!(pid, "sent SIGTERM to daemon");

    let deadline = Instant::now() + STOP_TIMEOUT;
    while Instant::now() < deadline {
        if !is_alive(pid) || !settings.pid_file.exists() {
            return Ok(StopOutcome::Stopped(pid));
        }
        thread::sleep(POLL_INTERVAL);
    }
    Err(DaemonError::StopTimeout {
        pid,
        waited: STOP_TIMEOUT,
    })
}

/// Runs `tick` immediately and then once per `interval` until `stop` fires
/// or its sender is dropped, finishing with one last tick. A failed tick is
/// logged and retried on the next interval. Returns the number of ticks run.
pub fn run_loop<T, E, F>(mut tick: F, stop: &Receiver<()>, interval: Duration) -> usize
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let mut ticks = 0usize;
    loop {
        run_tick(&mut tick, &mut ticks);
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("stop requested, flushing");
    run_tick(&mut tick, &mut ticks);
    ticks
}

fn run_tick<T, E, F>(tick: &mut F, ticks: &mut usize)
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    *ticks += 1;
    if let Err(err) = tick() {
        warn!(tick = *ticks, error = %err, "tick failed, retrying next interval");
    }
}

/// Body of `watch --foreground`: claims the PID file, ingests on every tick
/// and releases the PID file once the final flush is done.
pub fn run_foreground(settings: &Settings) -> Result<usize, DaemonError> {
    fs::create_dir_all(&settings.root).map_err(|source| DaemonError::StateDir {
        path: settings.root.clone(),
        source,
    })?;

    // The handler must be live before the PID is published: `stop` may
    // signal as soon as it can read the file.
    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    let store = SqliteStore::open(&settings.database.to_string_lossy())?;
    let processor = LogProcessor::from_settings(settings);

    let mut guard = PidGuard::new(&settings.pid_file);
    guard.acquire()?;

    info!(
        pid = std::process::id(),
        interval_secs = settings.tick_interval.as_secs(),
        log = %processor.usage_log().display(),
        "daemon running"
    );
    let ticks = run_loop(|| processor.process(&store), &stop_rx, settings.tick_interval);

    guard.release()?;
    info!(ticks, "daemon stopped");
    Ok(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn stop_before_first_interval_runs_initial_tick_and_flush() {
        let (tx, rx) = mpsc::channel();
        tx.send(()).expect("send stop");
        let calls = Cell::new(0);

        let ticks = run_loop(
            || {
                calls.set(calls.get() + 1);
                Ok::<(), String>(())
            },
            &rx,
            Duration::from_secs(60),
        );
        assert_eq!(ticks, 2);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn ticks_repeat_on_interval_until_stopped() {
        let (tx, rx) = mpsc::channel();
        let calls = Cell::new(0);

        let ticks = run_loop(
            || {
                calls.set(calls.get() + 1);
                if calls.get() == 3 {
                    tx.send(()).expect("send stop");
                }
                Ok::<(), String>(())
            },
            &rx,
            Duration::from_millis(5),
        );
        assert_eq!(ticks, 4);
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn failed_ticks_do_not_end_the_loop() {
        let (tx, rx) = mpsc::channel();
        let calls = Cell::new(0);

        let ticks = run_loop(
            || {
                calls.set(calls.get() + 1);
                if calls.get() == 2 {
                    tx.send(()).expect("send stop");
                }
                Err::<(), _>("store locked")
            },
            &rx,
            Duration::from_millis(5),
        );
        assert_eq!(ticks, 3);
    }

    #[test]
    fn dropped_sender_stops_the_loop() {
        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        let ticks = run_loop(|| Ok::<(), String>(()), &rx, Duration::from_secs(60));
        assert_eq!(ticks, 2);
    }

    #[test]
    fn status_and_stop_on_a_stopped_daemon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::defaults(dir.path());

        let current = status(&settings).expect("status");
        assert!(!current.running);
        assert_eq!(current.pid, None);
        assert_eq!(stop(&settings).expect("stop"), StopOutcome::NotRunning);
    }

    #[test]
    fn start_reports_already_running_without_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::defaults(dir.path());
        fs::create_dir_all(&settings.root).expect("root");
        fs::write(&settings.pid_file, format!("{}\n", std::process::id())).expect("seed");

        let outcome = start(&settings, Path::new("/nonexistent/pruneguard"), &[]).expect("start");
        assert_eq!(outcome, StartOutcome::AlreadyRunning(std::process::id() as i32));
    }

    #[test]
    fn start_fails_when_the_child_exits_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::defaults(dir.path());

        let err = start(&settings, Path::new("false"), &[]).expect_err("false exits");
        assert!(matches!(err, DaemonError::ExitedEarly { .. }));
        assert!(settings.daemon_log.exists());
    }
}
