//! Execution interceptor.
//!
//! Installed under a symlink named after each tracked binary. Records the
//! invocation in the usage log, then replaces itself with the real binary.
//! This path uses only `std`: no config parsing, no logging framework, one
//! append-only write.

use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SHIM_NAME: &str = "pruneguard-shim";
pub const USAGE_LOG_ENV: &str = "PRUNEGUARD_USAGE_LOG";
pub const PREFIXES_ENV: &str = "PRUNEGUARD_PREFIXES";
pub const DEFAULT_PREFIXES: &[&str] = &["/opt/homebrew", "/usr/local", "/home/linuxbrew/.linuxbrew"];

const EXIT_NOT_EXECUTABLE: u8 = 126;
const EXIT_NOT_FOUND: u8 = 127;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimEnv {
    pub usage_log: Option<PathBuf>,
    pub prefixes: Vec<PathBuf>,
    pub own_exe: Option<PathBuf>,
    /// `PATH` as the caller saw it, for bare `argv[0]` names.
    pub search_path: Option<OsString>,
    pub cwd: Option<PathBuf>,
}

impl ShimEnv {
    pub fn from_process() -> Self {
        let usage_log = std::env::var_os(USAGE_LOG_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .map(|home| PathBuf::from(home).join(".pruneguard").join("usage.log"))
            });
        let prefixes = match std::env::var_os(PREFIXES_ENV).filter(|value| !value.is_empty()) {
            Some(raw) => std::env::split_paths(&raw)
                .filter(|path| !path.as_os_str().is_empty())
                .collect(),
            None => DEFAULT_PREFIXES.iter().map(PathBuf::from).collect(),
        };
        Self {
            usage_log,
            prefixes,
            own_exe: std::env::current_exe().ok(),
            search_path: std::env::var_os("PATH"),
            cwd: std::env::current_dir().ok(),
        }
    }
}

#[derive(Debug)]
pub enum ShimError {
    MissingArgv0,
    SelfInvocation(String),
    NotFound { name: String, searched: Vec<PathBuf> },
    Exec { path: PathBuf, source: io::Error },
}

impl ShimError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotFound { .. } => EXIT_NOT_FOUND,
            Self::MissingArgv0 | Self::SelfInvocation(_) | Self::Exec { .. } => EXIT_NOT_EXECUTABLE,
        }
    }
}

impl fmt::Display for ShimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingArgv0 => write!(f, "invoked without argv[0]"),
            Self::SelfInvocation(name) => write!(
                f,
                "refusing to run `{name}`: it resolves to the interceptor itself"
            ),
            Self::NotFound { name, searched } => {
                let searched = searched
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "real binary for `{name}` not found (searched: {searched})")
            }
            Self::Exec { path, source } => {
                write!(f, "failed to execute `{}`: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ShimError {}

pub fn run(args: Vec<OsString>) -> ExitCode {
    let env = ShimEnv::from_process();
    match dispatch(&args, &env) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{SHIM_NAME}: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

/// Logs the invocation and hands control to the real binary. On unix this
/// only returns on failure.
pub fn dispatch(args: &[OsString], env: &ShimEnv) -> Result<ExitCode, ShimError> {
    let argv0 = args.first().ok_or(ShimError::MissingArgv0)?;
    let name = invocation_name(argv0).ok_or(ShimError::MissingArgv0)?;
    if name == SHIM_NAME {
        return Err(ShimError::SelfInvocation(name));
    }

    if let Some(log) = &env.usage_log {
        append_usage_record(log, &invoked_path(argv0, env).to_string_lossy());
    }

    let real = resolve_real_binary(&name, &env.prefixes).ok_or_else(|| ShimError::NotFound {
        name: name.clone(),
        searched: env.prefixes.iter().map(|prefix| prefix.join("bin")).collect(),
    })?;
    if is_same_file(&real, env.own_exe.as_deref()) {
        return Err(ShimError::SelfInvocation(name));
    }

    exec_real(&real, argv0, &args[1..])
}

#[cfg(unix)]
fn exec_real(real: &Path, argv0: &OsStr, rest: &[OsString]) -> Result<ExitCode, ShimError> {
    use std::os::unix::process::CommandExt;

    let source = Command::new(real).arg0(argv0).args(rest).exec();
    Err(ShimError::Exec {
        path: real.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn exec_real(real: &Path, _argv0: &OsStr, rest: &[OsString]) -> Result<ExitCode, ShimError> {
    let status = Command::new(real)
        .args(rest)
        .status()
        .map_err(|source| ShimError::Exec {
            path: real.to_path_buf(),
            source,
        })?;
    let code = status.code().unwrap_or(1);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

pub fn invocation_name(argv0: &OsStr) -> Option<String> {
    let name = Path::new(argv0).file_name()?.to_str()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Absolute path the caller ran. A bare name is looked up on `PATH` the way
/// the shell found it; anything unresolvable is returned as given.
pub fn invoked_path(argv0: &OsStr, env: &ShimEnv) -> PathBuf {
    let given = Path::new(argv0);
    if given.is_absolute() {
        return given.to_path_buf();
    }
    if argv0.as_encoded_bytes().contains(&b'/') {
        return absolutize(given, env.cwd.as_deref());
    }
    env.search_path
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(given))
        .find(|candidate| candidate.exists())
        .map(|found| absolutize(&found, env.cwd.as_deref()))
        .unwrap_or_else(|| given.to_path_buf())
}

fn absolutize(path: &Path, cwd: Option<&Path>) -> PathBuf {
    match cwd {
        Some(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_path_buf(),
    }
}

pub fn format_record(timestamp_nanos: u128, argv0: &str) -> String {
    format!("{timestamp_nanos},{argv0}\n")
}

/// Appends one record with a single write. Every failure is ignored: the
/// user's command must run whether or not tracking works.
pub fn append_usage_record(log: &Path, argv0: &str) {
    if argv0.is_empty() || argv0.contains('\n') {
        return;
    }
    let Ok(elapsed) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return;
    };
    let record = format_record(elapsed.as_nanos(), argv0);

    let mut file = match open_append(log) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let created = log.parent().map(fs::create_dir_all);
            match created {
                Some(Ok(())) => match open_append(log) {
                    Ok(file) => file,
                    Err(_) => return,
                },
                _ => return,
            }
        }
        Err(_) => return,
    };
    let _ = file.write_all(record.as_bytes());
}

fn open_append(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub fn resolve_real_binary(name: &str, prefixes: &[PathBuf]) -> Option<PathBuf> {
    prefixes
        .iter()
        .map(|prefix| prefix.join("bin").join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn is_same_file(candidate: &Path, own_exe: Option<&Path>) -> bool {
    let Some(own_exe) = own_exe else {
        return false;
    };
    match (fs::canonicalize(candidate), fs::canonicalize(own_exe)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkSummary {
    pub created: usize,
    pub kept: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// Leaves `dir` with one symlink to `target` per name in `names`. Symlinks
/// for untracked names are deleted; anything that is not a symlink is left
/// alone and counted as skipped.
#[cfg(unix)]
pub fn refresh_links(dir: &Path, target: &Path, names: &BTreeSet<String>) -> io::Result<LinkSummary> {
    let mut summary = LinkSummary::default();
    fs::create_dir_all(dir)?;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let tracked = entry
            .file_name()
            .to_str()
            .is_some_and(|name| names.contains(name));
        if !tracked && entry.file_type()?.is_symlink() {
            fs::remove_file(entry.path())?;
            summary.removed += 1;
        }
    }

    for name in names {
        if name.is_empty() || name == SHIM_NAME || name.contains('/') {
            summary.skipped += 1;
            continue;
        }
        let link = dir.join(name);
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if fs::read_link(&link)? == target {
                    summary.kept += 1;
                    continue;
                }
                fs::remove_file(&link)?;
            }
            Ok(_) => {
                summary.skipped += 1;
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        std::os::unix::fs::symlink(target, &link)?;
        summary.created += 1;
    }
    Ok(summary)
}
